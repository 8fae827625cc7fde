use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;

use crate::{GatewayError, Result};

/// One-shot completion signal, shared by every clone.
#[derive(Clone, Debug)]
pub struct Done {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Done {
    fn default() -> Self {
        Self::new()
    }
}

impl Done {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` only for the call that completed the signal.
    #[inline]
    pub fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Runs a codec hook, turning a panic inside it into an error.
pub(crate) async fn catch_panic<F, T>(f: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(f).catch_unwind().await {
        Ok(res) => res,
        Err(e) => Err(GatewayError::CodecPanic(panic_message(e.as_ref())).into()),
    }
}

fn panic_message(e: &(dyn Any + Send)) -> String {
    if let Some(s) = e.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = e.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
