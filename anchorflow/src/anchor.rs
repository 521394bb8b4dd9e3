//! Visual anchors: template images plus the parameters used to match them.

use image::RgbaImage;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::errors::{FlowError, Result};

/// Rectangle in absolute screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "[i64; 4]")]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(FlowError::Configuration(format!(
                "region {x},{y} must have a non-zero size, got {width}x{height}"
            )));
        }
        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }
}

impl TryFrom<[i64; 4]> for Region {
    type Error = FlowError;

    fn try_from([x, y, w, h]: [i64; 4]) -> Result<Self> {
        let coord = |v: i64| {
            i32::try_from(v).map_err(|_| FlowError::Configuration(format!("region coordinate {v} out of range")))
        };
        let size = |v: i64| {
            u32::try_from(v).map_err(|_| FlowError::Configuration(format!("region size {v} out of range")))
        };
        Region::new(coord(x)?, coord(y)?, size(w)?, size(h)?)
    }
}

/// A loaded, immutable anchor.
#[derive(Clone)]
pub struct Anchor {
    name: String,
    path: PathBuf,
    template: Arc<RgbaImage>,
    confidence: f64,
    region: Option<Region>,
    click_offset: (i32, i32),
    alternate: Option<Box<Anchor>>,
}

impl fmt::Debug for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Anchor")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("size", &self.template.dimensions())
            .field("confidence", &self.confidence)
            .field("region", &self.region)
            .field("click_offset", &self.click_offset)
            .field("alternate", &self.alternate.as_ref().map(|a| a.name.as_str()))
            .finish()
    }
}

pub(crate) fn check_confidence(name: &str, confidence: f64) -> Result<f64> {
    if confidence.is_finite() && confidence > 0.0 && confidence <= 1.0 {
        Ok(confidence)
    } else {
        Err(FlowError::Configuration(format!(
            "anchor '{name}': confidence must be in (0, 1], got {confidence}"
        )))
    }
}

impl Anchor {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        template: Arc<RgbaImage>,
        confidence: f64,
    ) -> Result<Self> {
        let name = name.into();
        let confidence = check_confidence(&name, confidence)?;
        if template.width() == 0 || template.height() == 0 {
            return Err(FlowError::Configuration(format!(
                "anchor '{name}': template image is empty"
            )));
        }
        Ok(Self {
            name,
            path: path.into(),
            template,
            confidence,
            region: None,
            click_offset: (0, 0),
            alternate: None,
        })
    }

    pub fn with_region(mut self, region: Option<Region>) -> Self {
        self.region = region;
        self
    }

    pub fn with_click_offset(mut self, offset: (i32, i32)) -> Self {
        self.click_offset = offset;
        self
    }

    pub fn with_alternate(mut self, alternate: Anchor) -> Self {
        self.alternate = Some(Box::new(alternate));
        self
    }

    /// Same template and placement, different acceptance threshold.
    pub fn with_confidence(&self, confidence: f64) -> Result<Self> {
        let confidence = check_confidence(&self.name, confidence)?;
        Ok(Self {
            confidence,
            ..self.clone()
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn template(&self) -> &RgbaImage {
        &self.template
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn region(&self) -> Option<Region> {
        self.region
    }

    pub fn click_offset(&self) -> (i32, i32) {
        self.click_offset
    }

    pub fn alternate(&self) -> Option<&Anchor> {
        self.alternate.as_deref()
    }
}

/// Decoded template pixels keyed by path.
#[derive(Debug)]
pub struct TemplateCache {
    enabled: bool,
    templates: Mutex<HashMap<PathBuf, Arc<RgbaImage>>>,
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TemplateCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            templates: Mutex::new(HashMap::new()),
        }
    }

    /// Decode `path` once; later calls share the same pixels. Missing or
    /// undecodable files are configuration errors.
    pub fn load(&self, path: &Path) -> Result<Arc<RgbaImage>> {
        if self.enabled {
            let templates = self.templates.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(template) = templates.get(path) {
                return Ok(template.clone());
            }
        }

        if !path.is_file() {
            return Err(FlowError::Configuration(format!(
                "template image not found: {}",
                path.display()
            )));
        }
        let decoded = image::open(path)
            .map_err(|e| {
                FlowError::Configuration(format!("failed to decode template {}: {e}", path.display()))
            })?
            .to_rgba8();
        debug!(
            "Loaded template {} ({}x{})",
            path.display(),
            decoded.width(),
            decoded.height()
        );
        let template = Arc::new(decoded);

        if self.enabled {
            self.templates
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(path.to_path_buf(), template.clone());
        }
        Ok(template)
    }

    pub fn len(&self) -> usize {
        self.templates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
