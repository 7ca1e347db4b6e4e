//! Media acquisition seam.
//!
//! Voice and video modes must hold a local capture stream before a search
//! may begin. Acquisition is asynchronous and can fail with a permission or
//! device error; the controller defers the search while it is pending. The
//! acquired stream is owned for the whole page-level session: it survives
//! partner changes and is only released on shutdown.

use std::sync::Arc;

use async_trait::async_trait;
use drift_proto::ChatMode;

use crate::error::MediaError;

/// Opaque local capture stream handle.
pub trait MediaStream: Send + Sync {
    fn label(&self) -> &str;
}

pub type LocalMedia = Arc<dyn MediaStream>;

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, mode: ChatMode) -> Result<LocalMedia, MediaError>;
}

/// Stand-in source for environments without capture devices (the CLI). The
/// stream it yields carries no tracks; voice/video sessions still negotiate
/// the data channel.
pub struct NullMediaSource;

struct NullStream;

impl MediaStream for NullStream {
    fn label(&self) -> &str {
        "null"
    }
}

#[async_trait]
impl MediaSource for NullMediaSource {
    async fn acquire(&self, _mode: ChatMode) -> Result<LocalMedia, MediaError> {
        Ok(Arc::new(NullStream))
    }
}
