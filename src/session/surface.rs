//! Render Targets für lokale Vorschau und Remote-Video

use crate::media::MediaStream;

/// Ziel, an das ein Stream zur Darstellung gehängt wird
pub trait RenderTarget: Send {
    fn attach(&mut self, stream: MediaStream);

    fn detach(&mut self);

    fn source(&self) -> Option<&MediaStream>;
}

/// Speichert nur die aktuelle Quelle
#[derive(Debug, Default)]
pub struct VideoSurface {
    source: Option<MediaStream>,
}

impl VideoSurface {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RenderTarget for VideoSurface {
    fn attach(&mut self, stream: MediaStream) {
        self.source = Some(stream);
    }

    fn detach(&mut self) {
        self.source = None;
    }

    fn source(&self) -> Option<&MediaStream> {
        self.source.as_ref()
    }
}
