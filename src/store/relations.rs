//! Association index for the many-to-many set fields of a table.
//!
//! Mirrors each record's sets as `(parent_id, user_id)` pairs, plus the
//! reverse `(user_id, parent_id)` direction for "everything liked by X"
//! lookups. Entries are owned by their parent row: unindexing a row drops all
//! of its pairs.

use std::collections::{BTreeSet, HashMap};

use crate::entity::{Entity, EntityId, SetField, UserId};

#[derive(Debug, Default)]
pub struct RelationIndex {
    by_parent: HashMap<SetField, BTreeSet<(EntityId, UserId)>>,
    by_member: HashMap<SetField, BTreeSet<(UserId, EntityId)>>,
}

impl RelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every set membership of `record`.
    pub fn index<E: Entity>(&mut self, record: &E) {
        let parent = record.id();
        for &field in E::set_fields() {
            let Some(members) = record.members(field) else {
                continue;
            };
            let forward = self.by_parent.entry(field).or_default();
            let reverse = self.by_member.entry(field).or_default();
            for &user in members {
                forward.insert((parent, user));
                reverse.insert((user, parent));
            }
        }
    }

    /// Drop every set membership of `record`.
    pub fn unindex<E: Entity>(&mut self, record: &E) {
        let parent = record.id();
        for &field in E::set_fields() {
            let Some(members) = record.members(field) else {
                continue;
            };
            for &user in members {
                if let Some(forward) = self.by_parent.get_mut(&field) {
                    forward.remove(&(parent, user));
                }
                if let Some(reverse) = self.by_member.get_mut(&field) {
                    reverse.remove(&(user, parent));
                }
            }
        }
    }

    /// Members of `field` on `parent`, ascending.
    pub fn members_of(&self, field: SetField, parent: EntityId) -> Vec<UserId> {
        self.by_parent
            .get(&field)
            .map(|pairs| {
                pairs
                    .range((parent, UserId::MIN)..=(parent, UserId::MAX))
                    .map(|&(_, user)| user)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parents whose `field` contains `user`, ascending.
    pub fn parents_with_member(&self, field: SetField, user: UserId) -> Vec<EntityId> {
        self.by_member
            .get(&field)
            .map(|pairs| {
                pairs
                    .range((user, EntityId::MIN)..=(user, EntityId::MAX))
                    .map(|&(_, parent)| parent)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of pairs stored for `field`.
    pub fn len(&self, field: SetField) -> usize {
        self.by_parent.get(&field).map_or(0, BTreeSet::len)
    }

    pub fn clear(&mut self) {
        self.by_parent.clear();
        self.by_member.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Post;

    fn post(id: EntityId, likers: &[UserId]) -> Post {
        let mut post = Post::draft(1, "x");
        post.id = id;
        post.like_owner_ids = likers.iter().copied().collect();
        post
    }

    #[test]
    fn test_index_and_lookup() {
        let mut index = RelationIndex::new();
        index.index(&post(10, &[1, 2]));
        index.index(&post(11, &[2]));

        assert_eq!(index.members_of(SetField::LikeOwners, 10), vec![1, 2]);
        assert_eq!(index.parents_with_member(SetField::LikeOwners, 2), vec![10, 11]);
        assert_eq!(index.len(SetField::LikeOwners), 3);
        assert_eq!(index.len(SetField::Participants), 0);
    }

    #[test]
    fn test_unindex_cascades_all_pairs() {
        let mut index = RelationIndex::new();
        let p = post(10, &[1, 2, 3]);
        index.index(&p);
        index.unindex(&p);

        assert!(index.members_of(SetField::LikeOwners, 10).is_empty());
        assert!(index.parents_with_member(SetField::LikeOwners, 1).is_empty());
        assert_eq!(index.len(SetField::LikeOwners), 0);
    }
}
