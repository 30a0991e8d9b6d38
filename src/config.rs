use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use smithay::backend::allocator::{Fourcc, Modifier};

use crate::{DisplayError, Result};

pub const DEFAULT_FPS: f64 = 60.0;

/// Requested display mode, matched by kernel mode name (e.g. `1920x1080`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModeRequest {
    pub name: String,
    /// `None` accepts any refresh rate.
    pub refresh: Option<u32>,
}

impl ModeRequest {
    pub fn new(name: impl Into<String>, refresh: Option<u32>) -> Self {
        Self {
            name: name.into(),
            refresh: refresh.filter(|hz| *hz != 0),
        }
    }

    /// Parse `NAME` or `NAME@RATE`.
    pub fn parse(raw: &str, key: &str) -> Result<Self> {
        let raw = raw.trim();
        let (name, refresh) = match raw.rsplit_once('@') {
            Some((name, refresh)) => (name.trim(), Some(refresh.trim())),
            None => (raw, None),
        };
        if name.is_empty() {
            return Err(DisplayError::Config(format!(
                "invalid value for {key}: mode name must not be empty"
            )));
        }

        let refresh = match refresh {
            Some(rate) => Some(parse_u32(rate, key)?),
            None => None,
        };
        Ok(Self::new(name, refresh))
    }
}

impl std::fmt::Display for ModeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.refresh {
            Some(hz) => write!(f, "{}@{hz}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DisplayConfig {
    /// Explicit DRM node; `None` enumerates devices.
    pub device: Option<PathBuf>,
    pub mode: Option<ModeRequest>,
    /// Surface size override; `None` uses the mode's size.
    pub size: Option<(u32, u32)>,
    pub format: Fourcc,
    pub modifier: Modifier,
    pub fps: f64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            device: None,
            mode: None,
            size: None,
            format: Fourcc::Xrgb8888,
            modifier: Modifier::Linear,
            fps: DEFAULT_FPS,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    device: Option<PathBuf>,
    mode: Option<String>,
    refresh: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    format: Option<String>,
    modifier: Option<String>,
    fps: Option<f64>,
}

/// Load the config file (if any) and apply `SCANOUT_*` environment overrides.
pub fn load() -> Result<DisplayConfig> {
    let mut config = match config_path() {
        Some(path) if path.exists() => load_from_path(&path)?,
        Some(path) => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            DisplayConfig::default()
        }
        None => DisplayConfig::default(),
    };
    apply_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

pub fn load_from_path(path: &Path) -> Result<DisplayConfig> {
    let content = fs::read_to_string(path).map_err(|err| {
        DisplayError::Config(format!("failed to read config {}: {err}", path.display()))
    })?;
    let config = parse_toml(&content)
        .map_err(|err| DisplayError::Config(format!("{}: {err}", path.display())))?;
    tracing::info!(path = %path.display(), "loaded display config");
    Ok(config)
}

fn parse_toml(content: &str) -> Result<DisplayConfig> {
    let file: FileConfig =
        toml::from_str(content).map_err(|err| DisplayError::Config(err.to_string()))?;

    let mut config = DisplayConfig {
        device: file.device.filter(|path| !path.as_os_str().is_empty()),
        ..DisplayConfig::default()
    };

    if let Some(name) = file.mode.filter(|name| !name.trim().is_empty()) {
        let mut request = ModeRequest::parse(&name, "mode")?;
        if let Some(refresh) = file.refresh {
            request = ModeRequest::new(request.name, Some(refresh));
        }
        config.mode = Some(request);
    } else if file.refresh.is_some() {
        return Err(DisplayError::Config(
            "refresh requires mode to be set".to_owned(),
        ));
    }

    config.size = match (file.width, file.height) {
        (Some(w), Some(h)) if w != 0 && h != 0 => Some((w, h)),
        (None, None) | (Some(0), Some(0)) => None,
        (w, h) => {
            return Err(DisplayError::Config(format!(
                "width and height must be set together (width={w:?}, height={h:?})"
            )));
        }
    };

    if let Some(format) = file.format {
        config.format = parse_format(&format, "format")?;
    }
    if let Some(modifier) = file.modifier {
        config.modifier = parse_modifier(&modifier, "modifier")?;
    }
    if let Some(fps) = file.fps {
        config.fps = check_fps(fps, "fps")?;
    }

    Ok(config)
}

/// Apply `SCANOUT_*` overrides read through `lookup`.
pub fn apply_overrides(
    config: &mut DisplayConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    if let Some(device) = get("SCANOUT_DEVICE") {
        config.device = Some(PathBuf::from(device));
    }
    if let Some(mode) = get("SCANOUT_MODE") {
        config.mode = Some(ModeRequest::parse(&mode, "SCANOUT_MODE")?);
    }
    if let Some(size) = get("SCANOUT_SIZE") {
        config.size = Some(parse_size(&size, "SCANOUT_SIZE")?);
    }
    if let Some(format) = get("SCANOUT_FORMAT") {
        config.format = parse_format(&format, "SCANOUT_FORMAT")?;
    }
    if let Some(modifier) = get("SCANOUT_MODIFIER") {
        config.modifier = parse_modifier(&modifier, "SCANOUT_MODIFIER")?;
    }
    if let Some(fps) = get("SCANOUT_FPS") {
        let value = fps.trim().parse::<f64>().map_err(|err| {
            DisplayError::Config(format!("invalid value for SCANOUT_FPS: {fps} ({err})"))
        })?;
        config.fps = check_fps(value, "SCANOUT_FPS")?;
    }
    Ok(())
}

fn config_path() -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os("SCANOUT_CONFIG")
        && !explicit.is_empty()
    {
        return Some(PathBuf::from(explicit));
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME")
        && !xdg.is_empty()
    {
        return Some(PathBuf::from(xdg).join("scanout").join("config.toml"));
    }

    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(|home| {
            PathBuf::from(home)
                .join(".config")
                .join("scanout")
                .join("config.toml")
        })
}

pub fn parse_format(raw: &str, key: &str) -> Result<Fourcc> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "XRGB8888" | "XR24" => Ok(Fourcc::Xrgb8888),
        "ARGB8888" | "AR24" => Ok(Fourcc::Argb8888),
        "XBGR8888" | "XB24" => Ok(Fourcc::Xbgr8888),
        "ABGR8888" | "AB24" => Ok(Fourcc::Abgr8888),
        "RGB565" | "RG16" => Ok(Fourcc::Rgb565),
        _ => Err(DisplayError::Config(format!(
            "invalid value for {key}: {raw} (expected XRGB8888, ARGB8888, XBGR8888, ABGR8888 or RGB565)"
        ))),
    }
}

pub fn parse_modifier(raw: &str, key: &str) -> Result<Modifier> {
    let value = raw.trim().to_ascii_lowercase();
    match value.as_str() {
        "linear" => return Ok(Modifier::Linear),
        "invalid" => return Ok(Modifier::Invalid),
        _ => {}
    }

    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed.map(Modifier::from).map_err(|err| {
        DisplayError::Config(format!("invalid value for {key}: {raw} ({err})"))
    })
}

pub fn parse_size(raw: &str, key: &str) -> Result<(u32, u32)> {
    let (w, h) = raw
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| {
            DisplayError::Config(format!(
                "invalid value for {key}: {raw} (expected `<width>x<height>`)"
            ))
        })?;
    let width = parse_u32(w.trim(), key)?;
    let height = parse_u32(h.trim(), key)?;
    if width == 0 || height == 0 {
        return Err(DisplayError::Config(format!(
            "invalid value for {key}: {raw} (size must be non-zero)"
        )));
    }
    Ok((width, height))
}

fn parse_u32(raw: &str, key: &str) -> Result<u32> {
    raw.parse::<u32>()
        .map_err(|err| DisplayError::Config(format!("invalid value for {key}: {raw} ({err})")))
}

fn check_fps(value: f64, key: &str) -> Result<f64> {
    if !value.is_finite() || value <= 0.0 {
        return Err(DisplayError::Config(format!(
            "invalid value for {key}: {value} (must be greater than 0)"
        )));
    }
    Ok(value)
}
