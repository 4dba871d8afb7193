pub mod backoff;
pub mod dedup;
pub mod engine;
pub mod kv_store;
pub mod paths;
pub mod reconciler;
pub mod retry;
pub mod stores;
pub mod walker;
pub mod watermark;
pub mod webhook;

#[cfg(test)]
pub(crate) mod test_support;
