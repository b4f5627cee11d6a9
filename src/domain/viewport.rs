use serde::{Deserialize, Serialize};

/// Page surface applied before content is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub has_touch: bool,
}

impl Viewport {
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            has_touch: false,
        }
    }

    pub const fn with_touch(mut self, has_touch: bool) -> Self {
        self.has_touch = has_touch;
        self
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(1000, 1000).with_touch(true)
    }
}
