//! Server-Info-Text aus der Konfiguration
//!
//! Format: `name;stadt;land[;adresse;name;stadt;land]...`
//!
//! Das erste Tripel beschreibt diesen Server, jedes weitere Quadrupel einen
//! fest eingetragenen Server fuer die Verzeichnis-Liste. Adressen ohne Port
//! bekommen [`STANDARD_PORT`].

use crate::error::{SitzungsFehler, SitzungsResult};
use klangraum_protocol::control::{ServerInfo, ServerListenEintrag};
use std::net::{IpAddr, SocketAddr};

/// Standard-Port des Jam-Servers
pub const STANDARD_PORT: u16 = 22124;

/// Ergebnis von [`ServerKennung::parsen`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKennung {
    pub eigene: ServerInfo,
    /// Fest eingetragene Server (laufen nie ab)
    pub feste_eintraege: Vec<ServerListenEintrag>,
}

impl ServerKennung {
    pub fn parsen(text: &str, max_kanaele: u16) -> SitzungsResult<Self> {
        let felder: Vec<&str> = text.split(';').map(str::trim).collect();
        if felder.len() < 3 || (felder.len() - 3) % 4 != 0 {
            return Err(SitzungsFehler::ServerInfo(format!(
                "erwartet name;stadt;land[;adresse;name;stadt;land]..., erhalten {} Felder",
                felder.len()
            )));
        }

        let eigene = ServerInfo {
            name: felder[0].to_string(),
            stadt: felder[1].to_string(),
            land: land_parsen(felder[2])?,
            max_kanaele,
        };
        eigene.pruefen().map_err(SitzungsFehler::ServerInfo)?;

        let mut feste_eintraege = Vec::new();
        for gruppe in felder[3..].chunks_exact(4) {
            let eintrag = ServerListenEintrag {
                adresse: adresse_parsen(gruppe[0])?,
                name: gruppe[1].to_string(),
                stadt: gruppe[2].to_string(),
                land: land_parsen(gruppe[3])?,
                kanaele: 0,
            };
            if eintrag.name.is_empty() {
                return Err(SitzungsFehler::ServerInfo(format!(
                    "Server {} ohne Namen",
                    eintrag.adresse
                )));
            }
            feste_eintraege.push(eintrag);
        }

        Ok(Self {
            eigene,
            feste_eintraege,
        })
    }
}

fn land_parsen(feld: &str) -> SitzungsResult<u16> {
    if feld.is_empty() {
        return Ok(0);
    }
    feld.parse()
        .map_err(|_| SitzungsFehler::ServerInfo(format!("Laendercode '{feld}' ist keine Zahl")))
}

fn adresse_parsen(feld: &str) -> SitzungsResult<SocketAddr> {
    if let Ok(adresse) = feld.parse::<SocketAddr>() {
        return Ok(adresse);
    }
    feld.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, STANDARD_PORT))
        .map_err(|_| SitzungsFehler::ServerInfo(format!("Adresse '{feld}' ungueltig")))
}
