// =============================================================================
// TOKEN FILE MARKER
// =============================================================================
//
// Presence source for the authorization monitor: the "latest event" is the
// token file itself. The observed timestamp is the file's modification time
// so logs show when authorization actually completed.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::poller::{LatestEventSource, ObservedEvent, QueryError};

pub struct TokenFileMarker {
    path: PathBuf,
}

impl TokenFileMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LatestEventSource for TokenFileMarker {
    type Payload = PathBuf;

    async fn fetch_latest(&self) -> Result<Option<ObservedEvent<PathBuf>>, QueryError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => {
                let timestamp = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                Ok(Some(ObservedEvent {
                    timestamp,
                    payload: self.path.clone(),
                }))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(QueryError::Transient(format!(
                "failed to stat {}: {err}",
                self.path.display()
            ))),
        }
    }
}
