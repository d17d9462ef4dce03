//! Server-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Server ohne Konfigurationsdatei
//! lauffaehig ist. `validieren` laeuft vor dem Aufbau des Kerns; jeder
//! Fehler dort beendet den Start.

use anyhow::{bail, Context, Result};
use klangraum_observability::{log_format_gueltig, log_level_gueltig};
use klangraum_protocol::codec::FrameGroesse;
use klangraum_session::{ServerKennung, STANDARD_PORT, TAGE_BEREICH};
use klangraum_voice::{JitterBufferConfig, JitterBufferModus, MixConfig, MAX_NUM_CHANNELS};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerEinstellungen,
    pub netzwerk: NetzwerkEinstellungen,
    pub audio: AudioEinstellungen,
    pub verzeichnis: VerzeichnisEinstellungen,
    pub historie: HistorienEinstellungen,
    pub status: StatusEinstellungen,
    pub aufnahme: AufnahmeEinstellungen,
    pub logging: LoggingEinstellungen,
    /// Metriken und Health
    pub observability: ObservabilityEinstellungen,
}

/// Allgemeine Server-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEinstellungen {
    /// Anzeigename, falls kein `server_info` gesetzt ist
    pub name: String,
    /// Willkommensnachricht fuer neue Clients
    pub willkommen: Option<String>,
    /// `name;stadt;land[;adresse;name;stadt;land]...`
    pub server_info: Option<String>,
    pub max_kanaele: u16,
    /// Clients muessen vor dem Mischen der Lizenz zustimmen
    pub lizenz_erforderlich: bool,
    /// Beim Beenden alle Clients aktiv trennen
    pub alle_trennen_beim_beenden: bool,
}

impl Default for ServerEinstellungen {
    fn default() -> Self {
        Self {
            name: "Klangraum".into(),
            willkommen: None,
            server_info: None,
            max_kanaele: 10,
            lizenz_erforderlich: false,
            alle_trennen_beim_beenden: false,
        }
    }
}

/// Netzwerk-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetzwerkEinstellungen {
    pub bind_adresse: String,
    /// UDP-Port fuer Audio, Steuerung und Verzeichnis
    pub port: u16,
    /// Trennung nach so vielen Sekunden ohne Verkehr
    pub verbindungs_timeout_s: u64,
    /// Groesse der Sende-Queue in Datagrammen
    pub sende_queue: usize,
}

impl Default for NetzwerkEinstellungen {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            port: STANDARD_PORT,
            verbindungs_timeout_s: 30,
            sende_queue: 1024,
        }
    }
}

/// Audio-Einstellungen des Mix-Takts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEinstellungen {
    /// Samples pro Frame: 64 oder 128
    pub frame_groesse: usize,
    /// "adaptiv" oder "fixed"
    pub jitter_modus: String,
    pub jitter_start_ziel: usize,
    pub jitter_min_ziel: usize,
    pub jitter_max_ziel: usize,
    pub jitter_kapazitaet: usize,
    /// Anteil der Frame-Periode fuer die Dekodier-Phase (0 < x <= 1)
    pub mix_budget_anteil: f64,
}

impl Default for AudioEinstellungen {
    fn default() -> Self {
        let jitter = JitterBufferConfig::default();
        Self {
            frame_groesse: FrameGroesse::default().samples(),
            jitter_modus: "adaptiv".into(),
            jitter_start_ziel: jitter.start_ziel,
            jitter_min_ziel: jitter.min_ziel,
            jitter_max_ziel: jitter.max_ziel,
            jitter_kapazitaet: jitter.kapazitaet,
            mix_budget_anteil: 0.5,
        }
    }
}

/// Verzeichnis-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerzeichnisEinstellungen {
    /// Verzeichnis, bei dem sich dieser Server anmeldet (`host[:port]`)
    pub adresse: Option<String>,
    /// Dieser Server fuehrt selbst eine Server-Liste
    pub ist_verzeichnis: bool,
    /// Gelistete Server regelmaessig anpingen
    pub ping_server_in_liste: bool,
    /// Auch unerreichbare Server ausliefern
    pub alle_anzeigen: bool,
    pub registrierungs_intervall_s: u64,
    pub ping_intervall_s: u64,
}

impl Default for VerzeichnisEinstellungen {
    fn default() -> Self {
        Self {
            adresse: None,
            ist_verzeichnis: false,
            ping_server_in_liste: false,
            alle_anzeigen: false,
            registrierungs_intervall_s: 60,
            ping_intervall_s: 15,
        }
    }
}

/// Verbindungs-Historie
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorienEinstellungen {
    /// JSON-Zeilen-Datei; ohne Datei nur im Speicher
    pub datei: Option<String>,
    pub tage: u32,
}

impl Default for HistorienEinstellungen {
    fn default() -> Self {
        Self {
            datei: None,
            tage: klangraum_session::STANDARD_TAGE,
        }
    }
}

/// Status-Schnappschuss
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusEinstellungen {
    pub datei: Option<String>,
}

/// Aufnahme-Weiche
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AufnahmeEinstellungen {
    /// Zielverzeichnis; ohne Angabe keine Aufnahme
    pub verzeichnis: Option<String>,
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
    /// Log-Datei-Pfad (leer = nur stdout)
    pub datei: Option<String>,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            datei: None,
        }
    }
}

/// Observability-Einstellungen (Metriken + Health-Check)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityEinstellungen {
    pub aktiviert: bool,
    /// Port fuer Metriken und Health (Standard: 9300)
    pub port: u16,
}

impl Default for ObservabilityEinstellungen {
    fn default() -> Self {
        Self {
            aktiviert: true,
            port: 9300,
        }
    }
}

impl ServerConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }

    /// Prueft alle Werte, die den Kern ungueltig machen wuerden
    pub fn validieren(&self) -> Result<()> {
        let max = self.server.max_kanaele as usize;
        if max == 0 || max > MAX_NUM_CHANNELS {
            bail!("server.max_kanaele muss zwischen 1 und {MAX_NUM_CHANNELS} liegen, ist {max}");
        }
        if self.netzwerk.port == 0 {
            bail!("netzwerk.port darf nicht 0 sein");
        }
        if self.netzwerk.verbindungs_timeout_s == 0 {
            bail!("netzwerk.verbindungs_timeout_s muss groesser 0 sein");
        }
        if self.netzwerk.sende_queue == 0 {
            bail!("netzwerk.sende_queue muss groesser 0 sein");
        }
        if self.observability.aktiviert
            && (self.observability.port == 0 || self.observability.port == self.netzwerk.port)
        {
            bail!("observability.port {} ungueltig", self.observability.port);
        }
        self.frame_groesse()?;
        self.jitter_config()?;
        if !(self.audio.mix_budget_anteil > 0.0 && self.audio.mix_budget_anteil <= 1.0) {
            bail!(
                "audio.mix_budget_anteil muss in (0, 1] liegen, ist {}",
                self.audio.mix_budget_anteil
            );
        }
        if !TAGE_BEREICH.contains(&self.historie.tage) {
            bail!("historie.tage muss zwischen 1 und 366 liegen, ist {}", self.historie.tage);
        }
        if self.verzeichnis.registrierungs_intervall_s == 0 || self.verzeichnis.ping_intervall_s == 0
        {
            bail!("Verzeichnis-Intervalle muessen groesser 0 sein");
        }
        if !log_level_gueltig(&self.logging.level) {
            bail!("logging.level '{}' ungueltig", self.logging.level);
        }
        if !log_format_gueltig(&self.logging.format) {
            bail!("logging.format '{}' ungueltig", self.logging.format);
        }
        self.server_kennung()?;
        self.verzeichnis_adresse()?;
        self.udp_bind_adresse()?;
        Ok(())
    }

    pub fn frame_groesse(&self) -> Result<FrameGroesse> {
        FrameGroesse::aus_samples(self.audio.frame_groesse).with_context(|| {
            format!(
                "audio.frame_groesse muss 64 oder 128 sein, ist {}",
                self.audio.frame_groesse
            )
        })
    }

    pub fn jitter_config(&self) -> Result<JitterBufferConfig> {
        let a = &self.audio;
        let modus = match a.jitter_modus.as_str() {
            "adaptiv" => JitterBufferModus::Adaptiv,
            "fixed" => JitterBufferModus::Fixed,
            anderer => bail!("audio.jitter_modus '{anderer}' ungueltig (adaptiv|fixed)"),
        };
        if a.jitter_min_ziel == 0 || a.jitter_min_ziel > a.jitter_max_ziel {
            bail!(
                "Jitter-Ziele ungueltig: min {} max {}",
                a.jitter_min_ziel,
                a.jitter_max_ziel
            );
        }
        if a.jitter_kapazitaet <= a.jitter_max_ziel + 2 {
            bail!(
                "audio.jitter_kapazitaet {} muss groesser als max_ziel + 2 sein",
                a.jitter_kapazitaet
            );
        }
        Ok(JitterBufferConfig {
            modus,
            kapazitaet: a.jitter_kapazitaet,
            start_ziel: a.jitter_start_ziel,
            min_ziel: a.jitter_min_ziel,
            max_ziel: a.jitter_max_ziel,
            ..JitterBufferConfig::default()
        })
    }

    pub fn mix_config(&self) -> Result<MixConfig> {
        let frame_groesse = self.frame_groesse()?;
        Ok(MixConfig {
            max_kanaele: self.server.max_kanaele as usize,
            frame_groesse,
            jitter: self.jitter_config()?,
            mix_budget: frame_groesse.dauer().mul_f64(self.audio.mix_budget_anteil),
            lizenz_erforderlich: self.server.lizenz_erforderlich,
        })
    }

    /// Eigene Identitaet und feste Listeneintraege
    pub fn server_kennung(&self) -> Result<ServerKennung> {
        let text = match &self.server.server_info {
            Some(t) => t.clone(),
            None => format!("{};;", self.server.name),
        };
        ServerKennung::parsen(&text, self.server.max_kanaele)
            .map_err(|e| anyhow::anyhow!("server.server_info: {e}"))
    }

    /// Loest die Verzeichnis-Adresse auf (Port 22124, falls nicht angegeben)
    pub fn verzeichnis_adresse(&self) -> Result<Option<SocketAddr>> {
        let Some(adresse) = &self.verzeichnis.adresse else {
            return Ok(None);
        };
        let mit_port = if adresse.parse::<SocketAddr>().is_ok() || adresse.contains(':') {
            adresse.clone()
        } else {
            format!("{adresse}:{STANDARD_PORT}")
        };
        let aufgeloest = mit_port
            .to_socket_addrs()
            .with_context(|| format!("verzeichnis.adresse '{adresse}' nicht aufloesbar"))?
            .next()
            .with_context(|| format!("verzeichnis.adresse '{adresse}' ohne Ergebnis"))?;
        Ok(Some(aufgeloest))
    }

    pub fn udp_bind_adresse(&self) -> Result<SocketAddr> {
        let text = format!("{}:{}", self.netzwerk.bind_adresse, self.netzwerk.port);
        text.parse()
            .with_context(|| format!("netzwerk.bind_adresse '{text}' ungueltig"))
    }

    pub fn observability_bind_adresse(&self) -> Result<SocketAddr> {
        let text = format!("{}:{}", self.netzwerk.bind_adresse, self.observability.port);
        text.parse()
            .with_context(|| format!("Observability-Adresse '{text}' ungueltig"))
    }

    pub fn verbindungs_timeout(&self) -> Duration {
        Duration::from_secs(self.netzwerk.verbindungs_timeout_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_config_ist_valide() {
        let cfg = ServerConfig::default();
        cfg.validieren().unwrap();
        assert_eq!(cfg.server.max_kanaele, 10);
        assert_eq!(cfg.netzwerk.port, 22124);
        assert_eq!(cfg.audio.frame_groesse, 128);
        assert_eq!(cfg.historie.tage, 60);
        assert_eq!(cfg.udp_bind_adresse().unwrap().to_string(), "0.0.0.0:22124");
    }

    #[test]
    fn config_aus_toml_string() {
        let toml = r#"
            [server]
            server_info = "Uebungsraum;Graz;40;10.0.0.9;Keller;Linz;40"
            max_kanaele = 20
            lizenz_erforderlich = true

            [audio]
            frame_groesse = 64
            jitter_modus = "fixed"

            [verzeichnis]
            adresse = "127.0.0.1"
        "#;
        let cfg: ServerConfig = toml::from_str(toml).unwrap();
        cfg.validieren().unwrap();

        let kennung = cfg.server_kennung().unwrap();
        assert_eq!(kennung.eigene.name, "Uebungsraum");
        assert_eq!(kennung.eigene.max_kanaele, 20);
        assert_eq!(kennung.feste_eintraege.len(), 1);

        let mix = cfg.mix_config().unwrap();
        assert_eq!(mix.frame_groesse, FrameGroesse::Samples64);
        assert_eq!(mix.jitter.modus, JitterBufferModus::Fixed);
        assert!(mix.lizenz_erforderlich);
        assert_eq!(
            mix.mix_budget.as_micros(),
            FrameGroesse::Samples64.dauer().as_micros() / 2
        );

        assert_eq!(
            cfg.verzeichnis_adresse().unwrap(),
            Some("127.0.0.1:22124".parse().unwrap())
        );
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.netzwerk.port, 22124);
    }

    #[test]
    fn ungueltige_werte_werden_abgelehnt() {
        let mit = |f: fn(&mut ServerConfig)| {
            let mut cfg = ServerConfig::default();
            f(&mut cfg);
            cfg.validieren()
        };
        assert!(mit(|c| c.server.max_kanaele = 0).is_err());
        assert!(mit(|c| c.server.max_kanaele = 151).is_err());
        assert!(mit(|c| c.server.max_kanaele = 150).is_ok());
        assert!(mit(|c| c.netzwerk.port = 0).is_err());
        assert!(mit(|c| c.audio.frame_groesse = 256).is_err());
        assert!(mit(|c| c.audio.jitter_modus = "gross".into()).is_err());
        assert!(mit(|c| c.audio.jitter_min_ziel = 30).is_err());
        assert!(mit(|c| c.audio.mix_budget_anteil = 0.0).is_err());
        assert!(mit(|c| c.historie.tage = 0).is_err());
        assert!(mit(|c| c.historie.tage = 367).is_err());
        assert!(mit(|c| c.logging.level = "laut".into()).is_err());
        assert!(mit(|c| c.logging.format = "xml".into()).is_err());
        assert!(mit(|c| c.server.server_info = Some("nur;zwei".into())).is_err());
        assert!(mit(|c| c.observability.port = 22124).is_err());
    }

    #[test]
    fn fehlende_datei_ergibt_standard() {
        let dir = tempfile::tempdir().unwrap();
        let pfad = dir.path().join("gibt-es-nicht.toml");
        let cfg = ServerConfig::laden(pfad.to_str().unwrap()).unwrap();
        assert_eq!(cfg.server.name, "Klangraum");
    }
}
