//! Verbindungs-Historie
//!
//! Bei jedem Uebergang `Aktiv → Getrennt` wird ein Eintrag angehaengt.
//! Abfragen liefern nur Eintraege innerhalb des Aufbewahrungsfensters,
//! `bereinigen` schreibt den Speicher ohne die abgelaufenen neu.
//!
//! Das `HistorienSpeicher`-Trait abstrahiert den konkreten Speicher.

use crate::error::{SitzungsFehler, SitzungsResult};
use chrono::{DateTime, Utc};
use klangraum_core::SitzungsEreignis;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

/// Gueltiger Bereich fuer die Aufbewahrung in Tagen
pub const TAGE_BEREICH: std::ops::RangeInclusive<u32> = 1..=366;

/// Standard-Aufbewahrung in Tagen
pub const STANDARD_TAGE: u32 = 60;

// ---------------------------------------------------------------------------
// Eintrag
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorienEintrag {
    pub adresse: SocketAddr,
    pub name: String,
    pub verbunden_um: DateTime<Utc>,
    pub dauer_s: u64,
}

impl HistorienEintrag {
    /// Eintrag fuer eine beendete aktive Verbindung, sonst `None`
    pub fn aus_ereignis(ereignis: &SitzungsEreignis) -> Option<Self> {
        match ereignis {
            SitzungsEreignis::Getrennt {
                adresse,
                name,
                verbunden_um,
                dauer_s,
                war_aktiv: true,
                ..
            } => Some(Self {
                adresse: *adresse,
                name: name.clone(),
                verbunden_um: *verbunden_um,
                dauer_s: *dauer_s,
            }),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Speicher
// ---------------------------------------------------------------------------

/// Abstrakter Speicher fuer Historien-Eintraege
#[allow(async_fn_in_trait)]
pub trait HistorienSpeicher: Send + Sync {
    async fn anhaengen(&self, eintrag: &HistorienEintrag) -> SitzungsResult<()>;

    /// Alle gespeicherten Eintraege in Einfuege-Reihenfolge
    async fn laden(&self) -> SitzungsResult<Vec<HistorienEintrag>>;

    /// Ersetzt den gesamten Bestand
    async fn ersetzen(&self, eintraege: &[HistorienEintrag]) -> SitzungsResult<()>;
}

/// Datei mit einem JSON-Objekt pro Zeile (nur Anhaengen im Normalbetrieb)
#[derive(Debug)]
pub struct JsonZeilenSpeicher {
    pfad: PathBuf,
    schreib_lock: tokio::sync::Mutex<()>,
}

impl JsonZeilenSpeicher {
    pub fn new(pfad: impl Into<PathBuf>) -> Self {
        Self {
            pfad: pfad.into(),
            schreib_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn pfad(&self) -> &Path {
        &self.pfad
    }

    async fn verzeichnis_anlegen(&self) -> SitzungsResult<()> {
        if let Some(parent) = self.pfad.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}

impl HistorienSpeicher for JsonZeilenSpeicher {
    async fn anhaengen(&self, eintrag: &HistorienEintrag) -> SitzungsResult<()> {
        let mut zeile = serde_json::to_string(eintrag)?;
        zeile.push('\n');

        let _lock = self.schreib_lock.lock().await;
        self.verzeichnis_anlegen().await?;
        let mut datei = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.pfad)
            .await?;
        datei.write_all(zeile.as_bytes()).await?;
        datei.flush().await?;
        Ok(())
    }

    async fn laden(&self) -> SitzungsResult<Vec<HistorienEintrag>> {
        let inhalt = match tokio::fs::read_to_string(&self.pfad).await {
            Ok(i) => i,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut eintraege = Vec::new();
        for (nr, zeile) in inhalt.lines().enumerate() {
            if zeile.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(zeile) {
                Ok(e) => eintraege.push(e),
                Err(e) => {
                    tracing::warn!(
                        pfad = %self.pfad.display(),
                        zeile = nr + 1,
                        "Historien-Zeile uebersprungen: {}",
                        e
                    );
                }
            }
        }
        Ok(eintraege)
    }

    async fn ersetzen(&self, eintraege: &[HistorienEintrag]) -> SitzungsResult<()> {
        let mut inhalt = String::new();
        for e in eintraege {
            inhalt.push_str(&serde_json::to_string(e)?);
            inhalt.push('\n');
        }

        let _lock = self.schreib_lock.lock().await;
        self.verzeichnis_anlegen().await?;
        let tmp = self.pfad.with_extension("tmp");
        tokio::fs::write(&tmp, inhalt).await?;
        tokio::fs::rename(&tmp, &self.pfad).await?;
        Ok(())
    }
}

/// Fluechtiger Speicher (Tests, Betrieb ohne Historien-Datei)
#[derive(Debug, Default)]
pub struct SpeicherHistorie {
    eintraege: parking_lot::Mutex<Vec<HistorienEintrag>>,
}

impl SpeicherHistorie {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistorienSpeicher for SpeicherHistorie {
    async fn anhaengen(&self, eintrag: &HistorienEintrag) -> SitzungsResult<()> {
        self.eintraege.lock().push(eintrag.clone());
        Ok(())
    }

    async fn laden(&self) -> SitzungsResult<Vec<HistorienEintrag>> {
        Ok(self.eintraege.lock().clone())
    }

    async fn ersetzen(&self, eintraege: &[HistorienEintrag]) -> SitzungsResult<()> {
        *self.eintraege.lock() = eintraege.to_vec();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Historie
// ---------------------------------------------------------------------------

/// Historie mit Aufbewahrungsfenster
pub struct Historie<S> {
    speicher: S,
    tage: u32,
}

impl<S: HistorienSpeicher> Historie<S> {
    pub fn neu(speicher: S, tage: u32) -> SitzungsResult<Self> {
        if !TAGE_BEREICH.contains(&tage) {
            return Err(SitzungsFehler::UngueltigeEingabe(format!(
                "Aufbewahrung muss zwischen 1 und 366 Tagen liegen, ist {tage}"
            )));
        }
        Ok(Self { speicher, tage })
    }

    pub fn tage(&self) -> u32 {
        self.tage
    }

    /// Aeltester Verbindungszeitpunkt, der noch im Fenster liegt (inklusive)
    pub fn grenze(&self, jetzt: DateTime<Utc>) -> DateTime<Utc> {
        jetzt - chrono::Duration::days(i64::from(self.tage))
    }

    pub async fn eintrag_anhaengen(&self, eintrag: &HistorienEintrag) -> SitzungsResult<()> {
        self.speicher.anhaengen(eintrag).await?;
        tracing::debug!(adresse = %eintrag.adresse, name = %eintrag.name, dauer_s = eintrag.dauer_s, "Historien-Eintrag angehaengt");
        Ok(())
    }

    /// Eintraege innerhalb des Fensters, in Einfuege-Reihenfolge
    pub async fn abfragen(&self, jetzt: DateTime<Utc>) -> SitzungsResult<Vec<HistorienEintrag>> {
        let grenze = self.grenze(jetzt);
        let mut eintraege = self.speicher.laden().await?;
        eintraege.retain(|e| e.verbunden_um >= grenze);
        Ok(eintraege)
    }

    /// Entfernt abgelaufene Eintraege aus dem Speicher
    pub async fn bereinigen(&self, jetzt: DateTime<Utc>) -> SitzungsResult<usize> {
        let alle = self.speicher.laden().await?;
        let grenze = self.grenze(jetzt);
        let behalten: Vec<_> = alle.iter().filter(|e| e.verbunden_um >= grenze).cloned().collect();
        let entfernt = alle.len() - behalten.len();
        if entfernt > 0 {
            self.speicher.ersetzen(&behalten).await?;
            tracing::info!(entfernt, behalten = behalten.len(), "Historie bereinigt");
        }
        Ok(entfernt)
    }

    /// Haengt fuer `Getrennt`-Ereignisse aktiver Verbindungen einen Eintrag an
    pub async fn ereignis_verarbeiten(&self, ereignis: &SitzungsEreignis) -> SitzungsResult<bool> {
        match HistorienEintrag::aus_ereignis(ereignis) {
            Some(eintrag) => {
                self.eintrag_anhaengen(&eintrag).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Fuehrt die Historie aus dem Ereignis-Kanal, bis dieser geschlossen wird
///
/// Bereinigt beim Start und danach einmal taeglich.
pub async fn historie_fuehren<S: HistorienSpeicher>(
    historie: Arc<Historie<S>>,
    mut ereignisse: broadcast::Receiver<SitzungsEreignis>,
) {
    let mut bereinigung = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));

    loop {
        tokio::select! {
            _ = bereinigung.tick() => {
                if let Err(e) = historie.bereinigen(Utc::now()).await {
                    tracing::warn!("Historie konnte nicht bereinigt werden: {}", e);
                }
            }
            ereignis = ereignisse.recv() => {
                match ereignis {
                    Ok(ereignis) => {
                        if let Err(e) = historie.ereignis_verarbeiten(&ereignis).await {
                            tracing::warn!("Historien-Eintrag fehlgeschlagen: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(verpasst = n, "Historie hinkt Ereignissen hinterher");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    tracing::debug!("Historien-Task beendet");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use klangraum_core::{TrennGrund, VerbindungsId};

    fn eintrag(name: &str, verbunden_um: DateTime<Utc>) -> HistorienEintrag {
        HistorienEintrag {
            adresse: "10.0.0.1:22124".parse().unwrap(),
            name: name.into(),
            verbunden_um,
            dauer_s: 120,
        }
    }

    fn jetzt() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn abgelaufene_eintraege_fehlen_in_der_abfrage() {
        let historie = Historie::neu(SpeicherHistorie::new(), 60).unwrap();
        let jetzt = jetzt();
        historie
            .eintrag_anhaengen(&eintrag("alt", jetzt - chrono::Duration::days(61)))
            .await
            .unwrap();
        historie
            .eintrag_anhaengen(&eintrag("knapp", jetzt - chrono::Duration::days(59)))
            .await
            .unwrap();

        let namen: Vec<_> = historie
            .abfragen(jetzt)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(namen, vec!["knapp"]);
    }

    #[tokio::test]
    async fn bereinigen_entfernt_nur_abgelaufene() {
        let historie = Historie::neu(SpeicherHistorie::new(), 1).unwrap();
        let jetzt = jetzt();
        historie
            .eintrag_anhaengen(&eintrag("gestern", jetzt - chrono::Duration::hours(30)))
            .await
            .unwrap();
        historie
            .eintrag_anhaengen(&eintrag("heute", jetzt - chrono::Duration::hours(2)))
            .await
            .unwrap();

        assert_eq!(historie.bereinigen(jetzt).await.unwrap(), 1);
        assert_eq!(historie.bereinigen(jetzt).await.unwrap(), 0);
        assert_eq!(historie.abfragen(jetzt).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn nur_aktive_verbindungen_werden_erfasst() {
        let historie = Historie::neu(SpeicherHistorie::new(), 60).unwrap();
        let ereignis = |war_aktiv| SitzungsEreignis::Getrennt {
            id: VerbindungsId::new(),
            adresse: "10.0.0.2:5000".parse().unwrap(),
            name: "Drums".into(),
            verbunden_um: Utc::now(),
            dauer_s: 5,
            war_aktiv,
            grund: TrennGrund::ClientBeendet,
        };
        assert!(historie.ereignis_verarbeiten(&ereignis(true)).await.unwrap());
        assert!(!historie.ereignis_verarbeiten(&ereignis(false)).await.unwrap());
        assert_eq!(historie.abfragen(Utc::now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fenstergrenze_ist_inklusive() {
        let historie = Historie::neu(SpeicherHistorie::new(), 30).unwrap();
        let jetzt = jetzt();
        let tage = |n: i64| jetzt - chrono::Duration::days(n);
        for (name, zeit) in [
            ("zu_alt", tage(31)),
            ("eine_sekunde_zu_alt", tage(30) - chrono::Duration::seconds(1)),
            ("genau", tage(30)),
            ("knapp_drin", tage(30) + chrono::Duration::seconds(1)),
            ("einen_tag_drin", tage(29)),
        ] {
            historie.eintrag_anhaengen(&eintrag(name, zeit)).await.unwrap();
        }

        let namen: Vec<_> = historie
            .abfragen(jetzt)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(namen, vec!["genau", "knapp_drin", "einen_tag_drin"]);

        // Bereinigen zieht dieselbe Grenze
        assert_eq!(historie.bereinigen(jetzt).await.unwrap(), 2);
        assert_eq!(historie.abfragen(jetzt).await.unwrap().len(), 3);
    }

    #[test]
    fn ungueltige_aufbewahrung() {
        assert!(Historie::neu(SpeicherHistorie::new(), 0).is_err());
        assert!(Historie::neu(SpeicherHistorie::new(), 367).is_err());
        assert!(Historie::neu(SpeicherHistorie::new(), 1).is_ok());
        assert!(Historie::neu(SpeicherHistorie::new(), 366).is_ok());
    }
}
