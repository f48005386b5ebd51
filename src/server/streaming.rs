//! SSE (Server-Sent Events) streaming of window snapshots.
//!
//! Every [`Page`] a window produces becomes one `page` event carrying the
//! JSON-encoded [`PageResponse`]. When the window stream ends (server
//! shutdown) a final `end` event is sent.

use axum::response::sse::Event;
use futures::stream::Stream;
use serde::Serialize;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::paging::Page;
use crate::server::api::PageResponse;

/// Convert a stream of window snapshots into an SSE stream.
pub fn page_to_sse_stream<E, S>(
    pages: S,
    request_id: String,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>>
where
    E: Serialize,
    S: Stream<Item = Page<E>>,
{
    let closing_id = request_id.clone();

    pages
        .map(move |page| {
            let generation = page.generation;
            let response = PageResponse::from(page);
            let data = serde_json::to_string(&response).unwrap_or_default();
            debug!(request_id = %request_id, generation, "Page pushed");
            Ok(Event::default()
                .event("page")
                .id(generation.to_string())
                .data(data))
        })
        .chain(tokio_stream::once(Ok(Event::default()
            .event("end")
            .data(closing_id))))
}
