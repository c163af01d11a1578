pub mod still;
pub mod video;

/// Final bytes for one archive group plus the extension they should be saved under.
#[derive(Debug, Clone)]
pub struct CompositeResult {
    pub bytes: Vec<u8>,
    /// Includes the leading dot, e.g. ".jpg"
    pub extension: String,
}

/// An overlay layer pulled out of the archive, in archive order.
#[derive(Debug, Clone)]
pub struct OverlayLayer {
    pub name: String,
    pub bytes: Vec<u8>,
}
