// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Settings record consumed by every encoder variant.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Side length used when images are split into 16×16 blocks.
pub const BLOCK_SIDE: usize = 16;

/// Bit depth as written in configuration files: an integer, a float that is
/// truncated, or a numeric string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaskingArgs {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MaskingArgs {
    fn coerce(&self) -> Result<i64, ConfigError> {
        match self {
            MaskingArgs::Integer(value) => Ok(*value),
            MaskingArgs::Float(value) if value.is_finite() => Ok(value.trunc() as i64),
            MaskingArgs::Float(value) => Err(ConfigError::InvalidMaskingArgs {
                raw: value.to_string(),
            }),
            MaskingArgs::Text(raw) => {
                raw.trim()
                    .parse::<i64>()
                    .map_err(|_| ConfigError::InvalidMaskingArgs { raw: raw.clone() })
            }
        }
    }
}

impl From<u32> for MaskingArgs {
    fn from(value: u32) -> Self {
        MaskingArgs::Integer(i64::from(value))
    }
}

impl From<String> for MaskingArgs {
    fn from(value: String) -> Self {
        MaskingArgs::Text(value)
    }
}

/// Embedding mask for whole-image mode. `data` holds `channels * H * W`
/// values laid out channel-major; a single channel is shared by R, G and B.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaskSpec {
    pub channels: usize,
    pub data: Vec<f32>,
}

impl MaskSpec {
    /// Mask with the same value at every position.
    pub fn constant(channels: usize, (h, w): (usize, usize), value: f32) -> Self {
        Self {
            channels,
            data: vec![value; channels * h * w],
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("encoder_channels must be positive")]
    ZeroChannels,
    #[error("encoder_blocks must be at least 1")]
    ZeroBlocks,
    #[error("{field} must be positive for the selected mode")]
    ZeroMessageLength { field: &'static str },
    #[error("whole-image mode needs positive dimensions, got {h}x{w}")]
    ZeroDimensions { h: usize, w: usize },
    #[error("mask must have 1 or 3 channels, got {channels}")]
    MaskChannels { channels: usize },
    #[error("mask holds {got} values but {expected} are required")]
    MaskLength { expected: usize, got: usize },
    #[error("bitwise encoders require masking_args")]
    MissingMaskingArgs,
    #[error("masking_args '{raw}' is not an integer bit depth")]
    InvalidMaskingArgs { raw: String },
    #[error("bit depth {bits} is outside 1..=8")]
    BitDepthOutOfRange { bits: i64 },
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("unsupported configuration format for {path}; expected .json or .toml")]
    UnsupportedFormat { path: PathBuf },
}

/// Message length and spatial frame an encoder is built for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub message_length: usize,
    pub height: usize,
    pub width: usize,
}

impl Frame {
    pub fn hw(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn plane(&self) -> usize {
        self.height * self.width
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HiddenConfiguration {
    #[serde(alias = "H")]
    pub h: usize,
    #[serde(alias = "W")]
    pub w: usize,
    pub message_length: usize,
    #[serde(default)]
    pub message_block_length: usize,
    pub encoder_channels: usize,
    pub encoder_blocks: usize,
    #[serde(default)]
    pub split_image_into_16x16_blocks: bool,
    #[serde(default)]
    pub masking_args: Option<MaskingArgs>,
    #[serde(default)]
    pub mask: Option<MaskSpec>,
}

impl HiddenConfiguration {
    /// Whole-image configuration without a mask or bit depth.
    pub fn whole_image(
        (h, w): (usize, usize),
        message_length: usize,
        encoder_channels: usize,
        encoder_blocks: usize,
    ) -> Self {
        Self {
            h,
            w,
            message_length,
            message_block_length: 0,
            encoder_channels,
            encoder_blocks,
            split_image_into_16x16_blocks: false,
            masking_args: None,
            mask: None,
        }
    }

    /// 16×16 block configuration.
    pub fn blocks(
        message_block_length: usize,
        encoder_channels: usize,
        encoder_blocks: usize,
    ) -> Self {
        Self {
            h: BLOCK_SIDE,
            w: BLOCK_SIDE,
            message_length: 0,
            message_block_length,
            encoder_channels,
            encoder_blocks,
            split_image_into_16x16_blocks: true,
            masking_args: None,
            mask: None,
        }
    }

    pub fn with_masking_args(mut self, args: impl Into<MaskingArgs>) -> Self {
        self.masking_args = Some(args.into());
        self
    }

    pub fn with_mask(mut self, mask: MaskSpec) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Reads a `.json` or `.toml` configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_error = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&raw).map_err(|e| parse_error(e.to_string()))?,
            Some("toml") => toml::from_str(&raw).map_err(|e| parse_error(e.to_string()))?,
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    path: path.to_path_buf(),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings no encoder can be built from.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encoder_channels == 0 {
            return Err(ConfigError::ZeroChannels);
        }
        if self.encoder_blocks == 0 {
            return Err(ConfigError::ZeroBlocks);
        }
        if self.split_image_into_16x16_blocks {
            if self.message_block_length == 0 {
                return Err(ConfigError::ZeroMessageLength {
                    field: "message_block_length",
                });
            }
            return Ok(());
        }
        if self.message_length == 0 {
            return Err(ConfigError::ZeroMessageLength {
                field: "message_length",
            });
        }
        if self.h == 0 || self.w == 0 {
            return Err(ConfigError::ZeroDimensions {
                h: self.h,
                w: self.w,
            });
        }
        if let Some(mask) = &self.mask {
            if mask.channels != 1 && mask.channels != 3 {
                return Err(ConfigError::MaskChannels {
                    channels: mask.channels,
                });
            }
            let expected = mask.channels * self.h * self.w;
            if mask.data.len() != expected {
                return Err(ConfigError::MaskLength {
                    expected,
                    got: mask.data.len(),
                });
            }
        }
        Ok(())
    }

    /// Message length and spatial size for the selected mode.
    pub fn frame(&self) -> Frame {
        if self.split_image_into_16x16_blocks {
            Frame {
                message_length: self.message_block_length,
                height: BLOCK_SIDE,
                width: BLOCK_SIDE,
            }
        } else {
            Frame {
                message_length: self.message_length,
                height: self.h,
                width: self.w,
            }
        }
    }

    /// The mask that applies in the selected mode. Block mode never masks.
    pub fn active_mask(&self) -> Option<&MaskSpec> {
        if self.split_image_into_16x16_blocks {
            None
        } else {
            self.mask.as_ref()
        }
    }

    /// Number of low bits the bitwise encoders are allowed to rewrite.
    pub fn bit_depth(&self) -> Result<u32, ConfigError> {
        let args = self
            .masking_args
            .as_ref()
            .ok_or(ConfigError::MissingMaskingArgs)?;
        let bits = args.coerce()?;
        if !(1..=8).contains(&bits) {
            return Err(ConfigError::BitDepthOutOfRange { bits });
        }
        Ok(bits as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn block_mode_uses_fixed_frame() {
        let config = HiddenConfiguration::blocks(4, 8, 2);
        config.validate().unwrap();
        assert_eq!(
            config.frame(),
            Frame {
                message_length: 4,
                height: 16,
                width: 16
            }
        );
    }

    #[test]
    fn block_mode_ignores_mask() {
        let config = HiddenConfiguration::blocks(4, 8, 2).with_mask(MaskSpec::constant(1, (2, 2), 0.0));
        config.validate().unwrap();
        assert!(config.active_mask().is_none());
    }

    #[test]
    fn rejects_zero_sizes() {
        let mut config = HiddenConfiguration::whole_image((8, 8), 4, 0, 1);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroChannels)));
        config.encoder_channels = 4;
        config.encoder_blocks = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroBlocks)));
        config.encoder_blocks = 1;
        config.message_length = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroMessageLength {
                field: "message_length"
            })
        ));
    }

    #[test]
    fn rejects_malformed_masks() {
        let config = HiddenConfiguration::whole_image((2, 2), 4, 4, 1)
            .with_mask(MaskSpec::constant(2, (2, 2), 1.0));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MaskChannels { channels: 2 })
        ));
        let config = HiddenConfiguration::whole_image((2, 2), 4, 4, 1).with_mask(MaskSpec {
            channels: 3,
            data: vec![1.0; 4],
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MaskLength {
                expected: 12,
                got: 4
            })
        ));
    }

    #[test]
    fn masking_args_coercion() {
        let base = HiddenConfiguration::blocks(4, 8, 1);
        assert!(matches!(
            base.bit_depth(),
            Err(ConfigError::MissingMaskingArgs)
        ));
        assert_eq!(base.clone().with_masking_args(4u32).bit_depth().unwrap(), 4);
        let mut text = base.clone();
        text.masking_args = Some(MaskingArgs::Text(" 3 ".into()));
        assert_eq!(text.bit_depth().unwrap(), 3);
        let mut float = base.clone();
        float.masking_args = Some(MaskingArgs::Float(2.9));
        assert_eq!(float.bit_depth().unwrap(), 2);
        let mut junk = base.clone();
        junk.masking_args = Some(MaskingArgs::Text("four".into()));
        assert!(matches!(
            junk.bit_depth(),
            Err(ConfigError::InvalidMaskingArgs { .. })
        ));
        assert!(matches!(
            base.with_masking_args(9u32).bit_depth(),
            Err(ConfigError::BitDepthOutOfRange { bits: 9 })
        ));
    }

    #[test]
    fn loads_json_and_toml() {
        let mut json = NamedTempFile::with_suffix(".json").unwrap();
        write!(
            json,
            r#"{{"H": 8, "W": 8, "message_length": 6, "encoder_channels": 4,
                "encoder_blocks": 2, "masking_args": "4"}}"#
        )
        .unwrap();
        let config = HiddenConfiguration::load(json.path()).unwrap();
        assert_eq!(config.frame().hw(), (8, 8));
        assert_eq!(config.bit_depth().unwrap(), 4);

        let mut toml_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(
            toml_file,
            "h = 16\nw = 16\nmessage_length = 0\nmessage_block_length = 5\n\
             encoder_channels = 8\nencoder_blocks = 1\n\
             split_image_into_16x16_blocks = true\nmasking_args = 2\n"
        )
        .unwrap();
        let config = HiddenConfiguration::load(toml_file.path()).unwrap();
        assert_eq!(config.frame().message_length, 5);
        assert_eq!(config.bit_depth().unwrap(), 2);
    }

    #[test]
    fn load_rejects_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            HiddenConfiguration::load(file.path()),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }
}
