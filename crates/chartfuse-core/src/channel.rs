//! In-process request/response transport to a [`Runtime`].
//!
//! A [`ChannelRuntime`] forwards requests over an mpsc channel to a task
//! that owns the runtime; each reply comes back on its own oneshot. Only
//! the requests a remote runtime can answer are accepted.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::{ExtractOptions, PreTransformOptions};
use crate::error::{ChartError, Result};
use crate::graph::ScopedVariable;
use crate::runtime::{Runtime, TransformedDatasets, TransformedSpec};
use crate::spec::ChartSpec;

const QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub enum QueryRequest {
    PreTransformSpec {
        spec: ChartSpec,
        options: PreTransformOptions,
    },
    PreTransformDatasets {
        spec: ChartSpec,
        variables: Vec<ScopedVariable>,
        options: PreTransformOptions,
    },
    PreTransformExtract {
        spec: ChartSpec,
        options: ExtractOptions,
    },
}

impl QueryRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryRequest::PreTransformSpec { .. } => "pre_transform_spec",
            QueryRequest::PreTransformDatasets { .. } => "pre_transform_datasets",
            QueryRequest::PreTransformExtract { .. } => "pre_transform_extract",
        }
    }
}

#[derive(Debug, Clone)]
pub enum QueryResponse {
    Spec(TransformedSpec),
    Datasets(TransformedDatasets),
}

type Envelope = (QueryRequest, oneshot::Sender<Result<QueryResponse>>);

/// Client half of the transport. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct ChannelRuntime {
    sender: mpsc::Sender<Envelope>,
}

impl ChannelRuntime {
    /// Spawn the serving task on the current tokio runtime. It stops once
    /// every `ChannelRuntime` clone is dropped.
    pub fn spawn(runtime: Runtime) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Envelope>(QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some((request, reply)) = receiver.recv().await {
                let runtime = runtime.clone();
                tokio::spawn(async move {
                    let kind = request.kind();
                    debug!(request = kind, "serving request");
                    if reply.send(runtime.query_request(request).await).is_err() {
                        warn!(request = kind, "requester went away before the reply");
                    }
                });
            }
            debug!("channel runtime stopped");
        });
        Self { sender }
    }

    pub async fn pre_transform_spec(
        &self,
        spec: &ChartSpec,
        options: &PreTransformOptions,
    ) -> Result<TransformedSpec> {
        let request = QueryRequest::PreTransformSpec {
            spec: spec.clone(),
            options: options.clone(),
        };
        match self.send(request).await? {
            QueryResponse::Spec(out) => Ok(out),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn pre_transform_datasets(
        &self,
        spec: &ChartSpec,
        variables: &[ScopedVariable],
        options: &PreTransformOptions,
    ) -> Result<TransformedDatasets> {
        let request = QueryRequest::PreTransformDatasets {
            spec: spec.clone(),
            variables: variables.to_vec(),
            options: options.clone(),
        };
        match self.send(request).await? {
            QueryResponse::Datasets(out) => Ok(out),
            other => Err(unexpected(&other)),
        }
    }

    /// Extraction returns binary blobs next to the spec, which this
    /// transport does not carry.
    pub async fn pre_transform_extract(
        &self,
        spec: &ChartSpec,
        options: &ExtractOptions,
    ) -> Result<()> {
        let request = QueryRequest::PreTransformExtract {
            spec: spec.clone(),
            options: options.clone(),
        };
        self.send(request).await.map(|_| ())
    }

    async fn send(&self, request: QueryRequest) -> Result<QueryResponse> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send((request, reply))
            .await
            .map_err(|_| ChartError::internal("channel runtime has stopped"))?;
        response
            .await
            .map_err(|_| ChartError::internal("channel runtime dropped the request"))?
    }
}

fn unexpected(response: &QueryResponse) -> ChartError {
    let kind = match response {
        QueryResponse::Spec(_) => "spec",
        QueryResponse::Datasets(_) => "datasets",
    };
    ChartError::internal(format!("unexpected {kind} response"))
}
