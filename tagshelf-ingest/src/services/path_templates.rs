//! Path template resolver
//!
//! Turns artist/album/library values into a validated relative path. No
//! filesystem access: resolution depends only on the template, the values
//! and the `[paths]` configuration.

use crate::config::{LibraryTemplates, PathConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Placeholders a template may contain
pub const ALLOWED_PLACEHOLDERS: &[&str] = &[
    "library",
    "artist_dir_code",
    "artist",
    "album",
    "year",
    "genre",
    "type",
];

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Path template errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Unknown placeholder '{{{0}}}'")]
    UnknownPlaceholder(String),

    #[error("Invalid template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("Path traversal in '{0}'")]
    Traversal(String),

    #[error("Path is {length} {unit}, maximum is {max}")]
    TooLong {
        length: usize,
        max: usize,
        unit: LengthUnit,
    },

    #[error("Path has {depth} segments, maximum is {max}")]
    TooDeep { depth: usize, max: usize },

    #[error("Reserved name '{0}' in path")]
    ReservedName(String),

    #[error("Template resolved to an empty path")]
    Empty,
}

/// Unit for the maximum path length
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthUnit {
    #[default]
    Bytes,
    Chars,
}

impl LengthUnit {
    fn measure(&self, s: &str) -> usize {
        match self {
            LengthUnit::Bytes => s.len(),
            LengthUnit::Chars => s.chars().count(),
        }
    }
}

impl fmt::Display for LengthUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LengthUnit::Bytes => write!(f, "bytes"),
            LengthUnit::Chars => write!(f, "chars"),
        }
    }
}

/// Default template per resolution mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateSet {
    pub production: String,
    pub staging: String,
    pub inbound: String,
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self {
            production: "{library}/{artist_dir_code}/{artist}/{year} - {album}".to_string(),
            staging: "{library}/{artist_dir_code}/{artist}/{album}".to_string(),
            inbound: "{library}/{artist}/{album}".to_string(),
        }
    }
}

/// Context a path is resolved for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    Staging,
    Inbound,
    Production,
}

/// Values substituted into a template; `None` placeholders are dropped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathValues {
    pub library: Option<String>,
    pub artist_dir_code: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub year: Option<i32>,
    pub genre: Option<String>,
    pub album_type: Option<String>,
}

impl PathValues {
    fn get(&self, placeholder: &str) -> Option<String> {
        match placeholder {
            "library" => self.library.clone(),
            "artist_dir_code" => self.artist_dir_code.clone(),
            "artist" => self.artist.clone(),
            "album" => self.album.clone(),
            "year" => self.year.map(|y| y.to_string()),
            "genre" => self.genre.clone(),
            "type" => self.album_type.clone(),
            _ => None,
        }
    }
}

/// Validated relative path and the template that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPath {
    pub path: PathBuf,
    pub template: String,
    pub mode: ResolutionMode,
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

fn invalid_template(template: &str, reason: impl Into<String>) -> PathError {
    PathError::InvalidTemplate {
        template: template.to_string(),
        reason: reason.into(),
    }
}

fn tokenize(template: &str) -> Result<Vec<Token<'_>>, PathError> {
    let mut tokens = Vec::new();
    let mut rest = template;

    while !rest.is_empty() {
        match rest.find(['{', '}']) {
            None => {
                tokens.push(Token::Literal(rest));
                break;
            }
            Some(pos) if rest[pos..].starts_with('}') => {
                return Err(invalid_template(template, "unmatched '}'"));
            }
            Some(pos) => {
                if pos > 0 {
                    tokens.push(Token::Literal(&rest[..pos]));
                }
                let after = &rest[pos + 1..];
                let close = after
                    .find('}')
                    .ok_or_else(|| invalid_template(template, "unclosed '{'"))?;
                let name = &after[..close];
                if name.contains('{') {
                    return Err(invalid_template(template, "nested '{'"));
                }
                tokens.push(Token::Placeholder(name));
                rest = &after[close + 1..];
            }
        }
    }

    Ok(tokens)
}

/// True when a segment's stem is a reserved device name
pub fn is_reserved_name(segment: &str) -> bool {
    let stem = segment.split('.').next().unwrap_or(segment).trim_end();
    RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
}

/// Validate a template string without substituting anything
pub fn validate_template(template: &str) -> Result<(), PathError> {
    if template.trim().is_empty() {
        return Err(invalid_template(template, "empty template"));
    }
    if template.starts_with('/') {
        return Err(invalid_template(template, "must be relative"));
    }
    if template.contains('\\') {
        return Err(invalid_template(template, "'\\' is not a separator"));
    }

    for token in tokenize(template)? {
        match token {
            Token::Placeholder(name) => {
                if !ALLOWED_PLACEHOLDERS.contains(&name) {
                    return Err(PathError::UnknownPlaceholder(name.to_string()));
                }
            }
            Token::Literal(text) => {
                for piece in text.split('/') {
                    if piece.trim() == ".." {
                        return Err(PathError::Traversal(template.to_string()));
                    }
                    if is_reserved_name(piece.trim()) {
                        return Err(PathError::ReservedName(piece.trim().to_string()));
                    }
                }
            }
        }
    }

    Ok(())
}

/// Sanitize one placeholder value; `None` when nothing usable remains
pub fn sanitize_value(value: &str) -> Option<String> {
    let mut out = String::with_capacity(value.len());
    let mut in_whitespace = false;

    for c in value.trim().chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                out.push('_');
            }
            in_whitespace = true;
            continue;
        }
        in_whitespace = false;
        if INVALID_CHARS.contains(&c) || c.is_control() {
            out.push('_');
        } else {
            out.push(c);
        }
    }

    if !out.is_empty() && out.chars().all(|c| c == '.') {
        out = "_".repeat(out.len());
    }
    let out = out.trim_end_matches(['.', ' ']).to_string();
    if out.is_empty() {
        return None;
    }

    Some(suffix_reserved(&out))
}

/// Append `_` to a reserved stem ("CON" → "CON_", "com1.txt" → "com1_.txt")
fn suffix_reserved(segment: &str) -> String {
    if !is_reserved_name(segment) {
        return segment.to_string();
    }
    match segment.split_once('.') {
        Some((stem, ext)) => format!("{}_.{}", stem, ext),
        None => format!("{}_", segment),
    }
}

fn clean_segment(segment: &str) -> Option<String> {
    let trimmed = segment.trim_matches(|c: char| c.is_whitespace() || matches!(c, '-' | '_' | '.'));
    if trimmed.is_empty() {
        return None;
    }
    Some(suffix_reserved(trimmed))
}

/// Resolves templates against the `[paths]` configuration
#[derive(Debug, Clone, Default)]
pub struct PathTemplateResolver {
    config: PathConfig,
}

impl PathTemplateResolver {
    pub fn new(config: PathConfig) -> Self {
        Self { config }
    }

    /// Template for a mode: the library's override if set, else the default
    pub fn template_for<'a>(
        &'a self,
        mode: ResolutionMode,
        overrides: Option<&'a LibraryTemplates>,
    ) -> &'a str {
        let custom = overrides.and_then(|t| match mode {
            ResolutionMode::Production => t.production.as_deref(),
            ResolutionMode::Staging => t.staging.as_deref(),
            ResolutionMode::Inbound => t.inbound.as_deref(),
        });

        custom.unwrap_or(match mode {
            ResolutionMode::Production => &self.config.templates.production,
            ResolutionMode::Staging => &self.config.templates.staging,
            ResolutionMode::Inbound => &self.config.templates.inbound,
        })
    }

    /// Resolve a mode's template for the given values
    pub fn resolve(
        &self,
        mode: ResolutionMode,
        values: &PathValues,
        overrides: Option<&LibraryTemplates>,
    ) -> Result<ResolvedPath, PathError> {
        let template = self.template_for(mode, overrides);
        let path = self.render(template, values)?;

        Ok(ResolvedPath {
            path: PathBuf::from(path),
            template: template.to_string(),
            mode,
        })
    }

    /// Substitute and validate; returns the `/`-joined relative path
    pub fn render(&self, template: &str, values: &PathValues) -> Result<String, PathError> {
        validate_template(template)?;

        let mut rendered = String::with_capacity(template.len() * 2);
        for token in tokenize(template)? {
            match token {
                Token::Literal(text) => rendered.push_str(text),
                Token::Placeholder(name) => {
                    if let Some(value) = values.get(name).as_deref().and_then(sanitize_value) {
                        rendered.push_str(&value);
                    }
                }
            }
        }

        let segments: Vec<String> = rendered.split('/').filter_map(clean_segment).collect();
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        let path = segments.join("/");
        self.validate_path(&path, &segments)?;
        Ok(path)
    }

    fn validate_path(&self, path: &str, segments: &[String]) -> Result<(), PathError> {
        if path.contains("../") || path.contains("..\\") || segments.iter().any(|s| s == "..") {
            return Err(PathError::Traversal(path.to_string()));
        }

        let length = self.config.length_unit.measure(path);
        if length > self.config.max_length {
            return Err(PathError::TooLong {
                length,
                max: self.config.max_length,
                unit: self.config.length_unit,
            });
        }

        if segments.len() > self.config.max_depth {
            return Err(PathError::TooDeep {
                depth: segments.len(),
                max: self.config.max_depth,
            });
        }

        if let Some(reserved) = segments.iter().find(|s| is_reserved_name(s)) {
            return Err(PathError::ReservedName(reserved.clone()));
        }

        Ok(())
    }
}
