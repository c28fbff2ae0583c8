use crate::{ProviderAdapter, ProviderRecord, ProviderResult, RecordPage};
use broker_core::InstanceConfig;
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use tracing::warn;

/// Fetches one page and enforces the page size even if the backend ignores it.
pub async fn list_page(
    adapter: &dyn ProviderAdapter,
    instance: &InstanceConfig,
    limit: usize,
    cursor: Option<&str>,
) -> ProviderResult<RecordPage> {
    let limit = limit.max(1);
    let mut page = adapter.list(instance, limit, cursor).await?;
    if page.records.len() > limit {
        warn!(
            provider = %adapter.kind(),
            instance = %instance.name,
            returned = page.records.len(),
            limit,
            "Provider returned more records than requested, truncating"
        );
        page.records.truncate(limit);
    }
    Ok(page)
}

enum Cursor {
    Start,
    After(String),
    Done,
}

/// Lazily walks every page of a provider listing. The stream ends after the
/// last page or the first error; calling it again starts from the beginning.
pub fn records<'a>(
    adapter: &'a dyn ProviderAdapter,
    instance: &'a InstanceConfig,
    limit: usize,
) -> BoxStream<'a, ProviderResult<ProviderRecord>> {
    records_with(move |cursor| async move {
        list_page(adapter, instance, limit, cursor.as_deref()).await
    })
}

/// Same walk as [`records`], with the caller deciding how each page is
/// fetched (deadlines, retries). `fetch` receives the cursor of the page.
pub fn records_with<'a, F, Fut>(fetch: F) -> BoxStream<'a, ProviderResult<ProviderRecord>>
where
    F: Fn(Option<String>) -> Fut + Send + Sync + 'a,
    Fut: Future<Output = ProviderResult<RecordPage>> + Send + 'a,
{
    stream::unfold((Cursor::Start, fetch), |(cursor, fetch)| async move {
        let current = match cursor {
            Cursor::Start => None,
            Cursor::After(cursor) => Some(cursor),
            Cursor::Done => return None,
        };

        match fetch(current.clone()).await {
            Ok(page) => {
                let next = match page.next_cursor {
                    // A provider handing back the same cursor would loop forever.
                    Some(next) if Some(&next) != current.as_ref() => Cursor::After(next),
                    _ => Cursor::Done,
                };
                let items: Vec<ProviderResult<ProviderRecord>> =
                    page.records.into_iter().map(Ok).collect();
                Some((items, (next, fetch)))
            }
            Err(error) => Some((vec![Err(error)], (Cursor::Done, fetch))),
        }
    })
    .flat_map(stream::iter)
    .boxed()
}
