//! Server-Status-Schnappschuss
//!
//! Wird vom Server periodisch erzeugt und an eine [`StatusSenke`]
//! uebergeben (z.B. eine Datei fuer externe Webseiten).

use crate::error::SitzungsResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Ein verbundener Teilnehmer im Schnappschuss
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Teilnehmer {
    pub slot: u16,
    pub name: String,
    pub stadt: String,
    pub land: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub zeitpunkt: DateTime<Utc>,
    pub verbunden: usize,
    pub max_kanaele: u16,
    pub teilnehmer: Vec<Teilnehmer>,
}

/// Ziel fuer Status-Schnappschuesse
#[allow(async_fn_in_trait)]
pub trait StatusSenke: Send + Sync {
    async fn schreiben(&self, status: &ServerStatus) -> SitzungsResult<()>;
}

/// Schreibt den Status als JSON-Datei (atomar per Umbenennen)
#[derive(Debug, Clone)]
pub struct JsonDateiSenke {
    pfad: PathBuf,
}

impl JsonDateiSenke {
    pub fn new(pfad: impl Into<PathBuf>) -> Self {
        Self { pfad: pfad.into() }
    }

    pub fn pfad(&self) -> &Path {
        &self.pfad
    }
}

impl StatusSenke for JsonDateiSenke {
    async fn schreiben(&self, status: &ServerStatus) -> SitzungsResult<()> {
        let json = serde_json::to_vec_pretty(status)?;
        let tmp = self.pfad.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.pfad).await?;
        Ok(())
    }
}
