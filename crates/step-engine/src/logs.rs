//! Follow-mode pod log streaming

use std::pin::Pin;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use tokio::io::{AsyncBufRead, BufReader};
use tokio::sync::oneshot;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::debug;

use crate::error::{Error, Result};

/// Open log stream owned by the caller; dropping it closes the connection.
pub type LogStream = Pin<Box<dyn AsyncBufRead + Send>>;

const LOG_BUFFER_BYTES: usize = 64 * 1024;

/// Follow the logs of `container` in pod `name`.
///
/// The API stream is pumped by a background task into an in-process pipe so
/// the returned stream doesn't borrow the `Api`. The call resolves once the
/// API has accepted the request, so a missing pod fails here rather than on
/// first read.
pub async fn open_log_stream(pods: Api<Pod>, name: &str, container: &str) -> Result<LogStream> {
    let (opened_tx, opened_rx) = oneshot::channel::<std::result::Result<(), kube::Error>>();
    let (reader, mut writer) = tokio::io::duplex(LOG_BUFFER_BYTES);

    let workload = name.to_string();
    let params = LogParams {
        follow: true,
        container: Some(container.to_string()),
        ..LogParams::default()
    };

    tokio::spawn(async move {
        let stream = match pods.log_stream(&workload, &params).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = opened_tx.send(Err(e));
                return;
            }
        };

        if opened_tx.send(Ok(())).is_err() {
            return;
        }

        let mut source = Box::pin(stream).compat();
        match tokio::io::copy(&mut source, &mut writer).await {
            Ok(bytes) => debug!(workload = %workload, bytes, "Log stream ended"),
            Err(e) => debug!(workload = %workload, error = %e, "Log stream closed"),
        }
    });

    match opened_rx.await {
        Ok(Ok(())) => Ok(Box::pin(BufReader::new(reader))),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::Observation {
            workload: name.to_string(),
            reason: "log task ended before the stream opened".to_string(),
        }),
    }
}
