//! Record of the image resident in reserved memory.

use crate::image::ImageId;

/// Resident image and the revision hardware accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ResidentImage {
    /// Image identifier.
    pub id: ImageId,
    /// Image revision.
    pub version: u32,
}

/// Per-controller cache deciding whether a load can be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadCache {
    resident: Option<ResidentImage>,
}

impl LoadCache {
    /// Empty cache.
    #[must_use]
    pub const fn new() -> Self {
        Self { resident: None }
    }

    /// Returns true when `id` is resident and fully loaded, so a transfer can be skipped.
    #[must_use]
    pub fn is_current(&self, id: &ImageId) -> bool {
        self.resident.is_some_and(|resident| resident.id == *id)
    }

    /// The resident image, if any.
    #[must_use]
    pub const fn resident(&self) -> Option<ResidentImage> {
        self.resident
    }

    /// Records a successful load.
    pub fn record(&mut self, id: ImageId, version: u32) {
        self.resident = Some(ResidentImage { id, version });
    }

    /// Forgets the resident image; the next load transfers again.
    pub fn invalidate(&mut self) {
        self.resident = None;
    }
}

#[cfg(test)]
mod tests {
    use super::LoadCache;
    use crate::image::{CpuSignature, ImageId};

    #[test]
    fn only_the_recorded_image_is_current() {
        let signature = CpuSignature::new(6, 0x8f, 6);
        let mut cache = LoadCache::new();
        assert!(!cache.is_current(&ImageId::new(signature, 1)));

        cache.record(ImageId::new(signature, 1), 7);
        assert!(cache.is_current(&ImageId::new(signature, 1)));
        assert!(!cache.is_current(&ImageId::new(signature, 2)));
        assert_eq!(cache.resident().map(|r| r.version), Some(7));

        cache.invalidate();
        assert!(!cache.is_current(&ImageId::new(signature, 1)));
    }
}
