//! Single-thread execution context for connections that report `main_thread`.
//!
//! [`SerializedConnection`] owns a dedicated OS thread running a
//! current-thread tokio runtime. Every call is shipped to that thread as a
//! job and answered through a oneshot channel; jobs run one at a time in
//! arrival order, so the wrapped connection never sees concurrent calls.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::connection::Connection;
use crate::error::{DataError, DataResult};
use crate::query::{Query, QueryOp};
use crate::schema::Schema;
use crate::table::Table;

type Job = Box<dyn FnOnce(Arc<dyn Connection>) -> BoxFuture<'static, ()> + Send>;

pub struct SerializedConnection {
    inner: Arc<dyn Connection>,
    sender: mpsc::UnboundedSender<Job>,
}

impl SerializedConnection {
    /// Spawn the dedicated thread and start serving calls to `inner`.
    pub fn new(inner: Arc<dyn Connection>) -> DataResult<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let conn = Arc::clone(&inner);
        std::thread::Builder::new()
            .name(format!("chartfuse-conn-{}", inner.id()))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to start connection thread runtime");
                        return;
                    }
                };
                runtime.block_on(async move {
                    while let Some(job) = receiver.recv().await {
                        job(Arc::clone(&conn)).await;
                    }
                });
                tracing::debug!("connection thread stopped");
            })?;
        Ok(Self { inner, sender })
    }

    async fn call<T, F>(&self, f: F) -> DataResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn Connection>) -> BoxFuture<'static, DataResult<T>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            async move {
                let _ = reply_tx.send(f(conn).await);
            }
            .boxed()
        });
        self.sender
            .send(job)
            .map_err(|_| DataError::Unavailable("connection thread has stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| DataError::Unavailable("connection thread dropped the request".into()))?
    }
}

#[async_trait]
impl Connection for SerializedConnection {
    fn id(&self) -> String {
        self.inner.id()
    }

    fn fallback(&self) -> bool {
        self.inner.fallback()
    }

    fn supports(&self, op: &QueryOp) -> bool {
        self.inner.supports(op)
    }

    async fn tables(&self) -> DataResult<HashMap<String, Schema>> {
        self.call(|c| async move { c.tables().await }.boxed()).await
    }

    async fn fetch_query(&self, query: &Query, expected: &Schema) -> DataResult<Table> {
        let query = query.clone();
        let expected = expected.clone();
        self.call(move |c| async move { c.fetch_query(&query, &expected).await }.boxed())
            .await
    }

    async fn register_table(&self, name: &str, table: Table, temporary: bool) -> DataResult<()> {
        let name = name.to_string();
        self.call(move |c| async move { c.register_table(&name, table, temporary).await }.boxed())
            .await
    }

    async fn register_csv(&self, name: &str, csv: &str, temporary: bool) -> DataResult<()> {
        let name = name.to_string();
        let csv = csv.to_string();
        self.call(move |c| async move { c.register_csv(&name, &csv, temporary).await }.boxed())
            .await
    }

    async fn register_json(&self, name: &str, json: &Value, temporary: bool) -> DataResult<()> {
        let name = name.to_string();
        let json = json.clone();
        self.call(move |c| async move { c.register_json(&name, &json, temporary).await }.boxed())
            .await
    }

    async fn register_parquet(&self, name: &str, bytes: &[u8], temporary: bool) -> DataResult<()> {
        let name = name.to_string();
        let bytes = bytes.to_vec();
        self.call(move |c| {
            async move { c.register_parquet(&name, &bytes, temporary).await }.boxed()
        })
        .await
    }

    async fn unregister(&self, name: &str) -> DataResult<()> {
        let name = name.to_string();
        self.call(move |c| async move { c.unregister(&name).await }.boxed())
            .await
    }
}
