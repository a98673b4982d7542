//! Lets one plugin instance be read from a copier task while remaining
//! externally closable from [`crate::Emitter::close`]. `Reader::read` needs
//! `&mut self`; `Closer::close` needs only `&self` and must be idempotent
//! and callable at any time — so the two halves share one `Arc<Mutex<T>>`
//! rather than each owning the plugin outright.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use wiretap_core::{Closer, Describe, Message, PluginError, Reader};

pub struct Shared<T> {
    inner: Arc<Mutex<T>>,
    label: String,
}

impl<T: Describe> Shared<T> {
    pub fn new(inner: T) -> Self {
        let label = inner.describe();
        Self {
            inner: Arc::new(Mutex::new(inner)),
            label,
        }
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            label: self.label.clone(),
        }
    }
}

#[async_trait]
impl<T: Reader> Reader for Shared<T> {
    async fn read(&mut self) -> Result<Option<Message>, PluginError> {
        self.inner.lock().await.read().await
    }
}

#[async_trait]
impl<T: Closer> Closer for Shared<T> {
    async fn close(&self) -> Result<(), PluginError> {
        self.inner.lock().await.close().await
    }
}

impl<T> Describe for Shared<T> {
    fn describe(&self) -> String {
        self.label.clone()
    }
}
