//! Fault-injecting object store for tests

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};
use std::sync::Mutex;

#[derive(Debug)]
struct PutFault {
    path_contains: String,
    remaining: usize,
    /// Apply the write before reporting the failure (an ambiguous failure)
    applied: bool,
}

/// In-memory store whose puts can be made to fail with a transient error
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: InMemory,
    fault: Mutex<Option<PutFault>>,
    puts: Mutex<Vec<String>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` puts whose path contains `path_contains`
    pub fn fail_puts(&self, path_contains: &str, times: usize, applied: bool) {
        *self.fault.lock().unwrap() = Some(PutFault {
            path_contains: path_contains.to_string(),
            remaining: times,
            applied,
        });
    }

    /// Paths of every put attempt, in order
    pub fn put_attempts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    fn take_fault(&self, location: &Path) -> Option<bool> {
        let mut fault = self.fault.lock().unwrap();
        let rule = fault.as_mut()?;
        if rule.remaining == 0 || !location.as_ref().contains(&rule.path_contains) {
            return None;
        }
        rule.remaining -= 1;
        Some(rule.applied)
    }
}

impl std::fmt::Display for FaultyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FaultyStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.puts.lock().unwrap().push(location.to_string());
        match self.take_fault(location) {
            Some(applied) => {
                if applied {
                    self.inner.put_opts(location, payload, opts).await?;
                }
                Err(object_store::Error::Generic {
                    store: "faulty",
                    source: format!("injected failure writing {}", location).into(),
                })
            }
            None => self.inner.put_opts(location, payload, opts).await,
        }
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}
