//! Artist directory codes
//!
//! Short uppercase mnemonics used to shard the library by artist
//! ("Led Zeppelin" → `LZ`). Generation is a pure function of the name and
//! configuration; uniqueness against the catalog is held by
//! [`DirectoryCodeSession`], which claims codes with a check-then-insert
//! protocol and moves to the next numeric suffix (`-2`, `-3`, …) whenever a
//! claim collides.

use crate::config::DirectoryCodeConfig;
use crate::db::directory_codes::{
    code_for_artist, code_for_artist_conn, code_owner, insert_code, upsert_code,
    ArtistDirectoryCode,
};
use crate::utils::{begin_monitored, retry_on_lock};
use regex::Regex;
use sqlx::SqlitePool;
use tagshelf_common::db::init::DEFAULT_MAX_LOCK_WAIT_MS;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Rule version recorded for operator-set codes
pub const MANUAL_RULE_VERSION: i64 = 0;

/// Directory code errors
#[derive(Debug, Error)]
pub enum CodeError {
    /// Code fails length or character-class validation
    #[error("Invalid directory code '{code}': {reason}")]
    Invalid { code: String, reason: String },

    /// Every suffix up to the collision bound is taken
    #[error("No free directory code for '{artist}' after {attempts} attempts")]
    CollisionLimit { artist: String, attempts: u32 },

    /// Requested code belongs to another artist
    #[error("Directory code '{0}' is already assigned")]
    Taken(String),

    /// Generator configuration is unusable
    #[error("Directory code configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Database(#[from] tagshelf_common::Error),
}

/// Pure code generation from configuration
#[derive(Debug, Clone)]
pub struct DirectoryCodeGenerator {
    config: DirectoryCodeConfig,
    pattern: Regex,
}

impl DirectoryCodeGenerator {
    pub fn new(config: DirectoryCodeConfig) -> Result<Self, CodeError> {
        let pattern = Regex::new(&config.code_pattern)
            .map_err(|e| CodeError::Config(format!("code_pattern: {}", e)))?;
        if config.min_length == 0 || config.min_length > config.max_length {
            return Err(CodeError::Config(format!(
                "min_length {} must be between 1 and max_length {}",
                config.min_length, config.max_length
            )));
        }
        Ok(Self { config, pattern })
    }

    pub fn rule_version(&self) -> i64 {
        self.config.rule_version
    }

    pub fn max_collisions(&self) -> u32 {
        self.config.max_collisions
    }

    fn is_article(&self, word: &str) -> bool {
        self.config
            .articles
            .iter()
            .any(|article| article.eq_ignore_ascii_case(word))
    }

    /// Normalize an artist name into space-separated words
    ///
    /// "&" becomes "and", "/" separates words, periods are dropped and
    /// whitespace collapses. A leading article is stripped only when more
    /// than one word remains after stripping.
    pub fn normalize_name(&self, name: &str) -> String {
        let expanded = name.replace('&', " and ").replace('/', " ").replace('.', "");
        let mut words: Vec<&str> = expanded.split_whitespace().collect();
        if words.len() > 2 && self.is_article(words[0]) {
            words.remove(0);
        }
        words.join(" ")
    }

    /// Base code for an artist name (before any collision suffix)
    pub fn base_code(&self, name: &str) -> String {
        let normalized = self.normalize_name(name);
        let max_length = self.config.max_length;

        // (word index, char) for every ASCII letter or digit
        let mut source: Vec<(usize, char, bool)> = Vec::new();
        for (index, word) in normalized.split_whitespace().enumerate() {
            let skip_word = index > 0 && self.is_article(word);
            let mut first = !skip_word;
            for c in word.chars().filter(char::is_ascii_alphanumeric) {
                source.push((index, c.to_ascii_uppercase(), first));
                first = false;
            }
        }

        let mut code: String = source
            .iter()
            .filter(|(_, _, initial)| *initial)
            .map(|(_, c, _)| *c)
            .take(max_length)
            .collect();

        if code.is_empty() {
            code = self.config.fallback_code.to_ascii_uppercase();
        } else if code.len() < self.config.min_length {
            let padding: Vec<char> = source
                .iter()
                .filter(|(_, _, initial)| !*initial)
                .map(|(_, c, _)| *c)
                .collect();
            for c in padding {
                if code.len() >= self.config.min_length {
                    break;
                }
                code.push(c);
            }
        }

        while code.len() < self.config.min_length {
            code.push('X');
        }
        code.truncate(max_length);
        code
    }

    /// Candidate for the given attempt: the base code first, then suffixed
    /// forms starting at 2, trimming the base to stay within max length
    pub fn candidate(&self, base: &str, attempt: u32) -> String {
        if attempt <= 1 {
            return base.to_string();
        }

        let suffix = self.config.suffix_pattern.replace("{n}", &attempt.to_string());
        let keep = self
            .config
            .max_length
            .saturating_sub(suffix.len())
            .max(1)
            .min(base.len());
        format!("{}{}", &base[..keep], suffix)
    }

    /// Validate length and character class
    pub fn validate(&self, code: &str) -> Result<(), CodeError> {
        if code.len() > self.config.max_length {
            return Err(CodeError::Invalid {
                code: code.to_string(),
                reason: format!("longer than {} characters", self.config.max_length),
            });
        }
        if !self.pattern.is_match(code) {
            return Err(CodeError::Invalid {
                code: code.to_string(),
                reason: format!("does not match {}", self.config.code_pattern),
            });
        }
        Ok(())
    }
}

enum ClaimOutcome {
    Claimed(ArtistDirectoryCode),
    AlreadyAssigned(ArtistDirectoryCode),
    Taken,
}

/// Catalog-backed code assignment
///
/// Safe across concurrent sessions and processes: each claim re-checks
/// uniqueness inside its transaction and the unique index rejects any
/// claim that still races.
#[derive(Debug, Clone)]
pub struct DirectoryCodeSession {
    pool: SqlitePool,
    generator: DirectoryCodeGenerator,
    max_lock_wait_ms: u64,
}

impl DirectoryCodeSession {
    pub fn new(pool: SqlitePool, generator: DirectoryCodeGenerator) -> Self {
        Self {
            pool,
            generator,
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
        }
    }

    pub fn with_max_lock_wait_ms(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }

    pub fn generator(&self) -> &DirectoryCodeGenerator {
        &self.generator
    }

    /// Stored code for an artist, if any
    pub async fn lookup(&self, artist_id: Uuid) -> Result<Option<ArtistDirectoryCode>, CodeError> {
        Ok(code_for_artist(&self.pool, artist_id).await?)
    }

    /// Return the artist's stored code, generating and persisting one if needed
    pub async fn code_for_artist(
        &self,
        artist_id: Uuid,
        artist_name: &str,
    ) -> Result<ArtistDirectoryCode, CodeError> {
        if let Some(existing) = self.lookup(artist_id).await? {
            return Ok(existing);
        }

        let base = self.generator.base_code(artist_name);
        let max_attempts = self.generator.max_collisions().max(1);

        for attempt in 1..=max_attempts {
            let candidate = self.generator.candidate(&base, attempt);
            self.generator.validate(&candidate)?;

            let candidate_ref = candidate.as_str();
            let outcome = retry_on_lock("directory code claim", self.max_lock_wait_ms, move || {
                self.try_claim(artist_id, candidate_ref)
            })
            .await?;

            match outcome {
                ClaimOutcome::Claimed(code) => {
                    info!(artist = artist_name, code = %code.code, attempt, "Assigned directory code");
                    return Ok(code);
                }
                ClaimOutcome::AlreadyAssigned(code) => return Ok(code),
                ClaimOutcome::Taken => {
                    debug!(artist = artist_name, candidate = %candidate, "Directory code taken");
                }
            }
        }

        Err(CodeError::CollisionLimit {
            artist: artist_name.to_string(),
            attempts: max_attempts,
        })
    }

    async fn try_claim(
        &self,
        artist_id: Uuid,
        candidate: &str,
    ) -> tagshelf_common::Result<ClaimOutcome> {
        let mut tx = begin_monitored(&self.pool, "directory_codes::claim").await?;

        if let Some(existing) = code_for_artist_conn(&mut **tx.inner_mut()?, artist_id).await? {
            tx.rollback().await?;
            return Ok(ClaimOutcome::AlreadyAssigned(existing));
        }

        if code_owner(&mut **tx.inner_mut()?, candidate, artist_id).await?.is_some() {
            tx.rollback().await?;
            return Ok(ClaimOutcome::Taken);
        }

        let code = ArtistDirectoryCode {
            artist_id,
            code: candidate.to_string(),
            rule_version: self.generator.rule_version(),
        };
        match insert_code(&mut **tx.inner_mut()?, &code).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                tx.rollback().await?;
                return Ok(ClaimOutcome::Taken);
            }
            Err(e) => return Err(e),
        }

        match tx.commit().await {
            Ok(()) => Ok(ClaimOutcome::Claimed(code)),
            Err(e) if e.is_unique_violation() => Ok(ClaimOutcome::Taken),
            Err(e) => Err(e),
        }
    }

    /// Manually set an artist's code (validated, unique, rule version 0)
    pub async fn override_code(
        &self,
        artist_id: Uuid,
        code: &str,
    ) -> Result<ArtistDirectoryCode, CodeError> {
        let code = code.trim().to_ascii_uppercase();
        self.generator.validate(&code)?;

        let record = ArtistDirectoryCode {
            artist_id,
            code: code.clone(),
            rule_version: MANUAL_RULE_VERSION,
        };
        let record_ref = &record;
        let applied = retry_on_lock("directory code override", self.max_lock_wait_ms, move || {
            self.try_override(record_ref)
        })
        .await?;

        if !applied {
            return Err(CodeError::Taken(code));
        }
        info!(artist_id = %artist_id, code = %code, "Directory code overridden");
        Ok(record)
    }

    async fn try_override(&self, record: &ArtistDirectoryCode) -> tagshelf_common::Result<bool> {
        let mut tx = begin_monitored(&self.pool, "directory_codes::override").await?;

        if code_owner(&mut **tx.inner_mut()?, &record.code, record.artist_id)
            .await?
            .is_some()
        {
            tx.rollback().await?;
            return Ok(false);
        }

        match upsert_code(&mut **tx.inner_mut()?, record).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                tx.rollback().await?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        tx.commit().await?;
        Ok(true)
    }
}
