//! Server-Verzeichnis
//!
//! [`ServerListe`] fuehrt die beim Verzeichnis angemeldeten Server
//! (nur wenn dieser Server selbst Verzeichnis ist). [`VerzeichnisDienst`]
//! ist ein kooperativer Task, der
//! - sich periodisch beim Verzeichnis anmeldet,
//! - im Ping-Modus alle gelisteten Server anpingt (haelt NAT-Zuordnungen
//!   offen, es wird kein Audio ausgetauscht),
//! - beim Beenden wieder abmeldet.
//!
//! Der Dienst haelt keinen Socket. Er spricht mit dem UDP-Task nur ueber
//! `mpsc`: ausgehend `VerzeichnisAuftrag`, eingehend `VerzeichnisEreignis`.

use dashmap::DashMap;
use klangraum_protocol::control::{Ping, ServerInfo, ServerListenEintrag, MAX_LISTEN_EINTRAEGE};
use klangraum_protocol::Nachricht;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Standard-Intervall fuer die Anmeldung beim Verzeichnis
pub const REGISTRIERUNGS_INTERVALL: Duration = Duration::from_secs(60);

/// Standard-Intervall fuer Pings an gelistete Server
pub const PING_INTERVALL: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// ServerListe
// ---------------------------------------------------------------------------

/// Ein Eintrag der Verzeichnis-Liste
#[derive(Debug, Clone)]
pub struct VerzeichnisEintrag {
    pub adresse: SocketAddr,
    pub info: ServerInfo,
    pub registriert_um: Instant,
    pub letzter_ping: Option<Instant>,
    pub erreichbar: bool,
    /// Fest eingetragen, laeuft nie ab
    pub permanent: bool,
    reihenfolge: u64,
}

impl VerzeichnisEintrag {
    fn listen_eintrag(&self) -> ServerListenEintrag {
        ServerListenEintrag {
            adresse: self.adresse,
            name: self.info.name.clone(),
            stadt: self.info.stadt.clone(),
            land: self.info.land,
            kanaele: self.info.max_kanaele,
        }
    }
}

/// Liste der beim Verzeichnis angemeldeten Server
///
/// Der eigene Eintrag steht immer vorne, danach Anmelde-Reihenfolge.
pub struct ServerListe {
    eigener: ServerListenEintrag,
    eintraege: DashMap<SocketAddr, VerzeichnisEintrag>,
    zaehler: AtomicU64,
}

impl ServerListe {
    pub fn neu(eigener: ServerListenEintrag) -> Self {
        Self {
            eigener,
            eintraege: DashMap::new(),
            zaehler: AtomicU64::new(0),
        }
    }

    /// Traegt einen festen Server ein (aus dem Server-Info-Text)
    pub fn permanent_eintragen(&self, eintrag: &ServerListenEintrag) {
        let info = ServerInfo {
            name: eintrag.name.clone(),
            stadt: eintrag.stadt.clone(),
            land: eintrag.land,
            max_kanaele: eintrag.kanaele,
        };
        self.einfuegen(eintrag.adresse, info, true);
    }

    /// Meldet einen Server an oder erneuert seine Anmeldung
    ///
    /// Gibt `true` fuer neue Server zurueck. Eine erneute Anmeldung behaelt
    /// den Listenplatz.
    pub fn registrieren(&self, adresse: SocketAddr, info: ServerInfo) -> bool {
        if adresse == self.eigener.adresse {
            return false;
        }
        if let Some(mut e) = self.eintraege.get_mut(&adresse) {
            e.info = info;
            e.registriert_um = Instant::now();
            e.erreichbar = true;
            return false;
        }
        if self.eintraege.len() + 1 >= MAX_LISTEN_EINTRAEGE {
            tracing::warn!(adresse = %adresse, "Server-Liste voll, Anmeldung abgelehnt");
            return false;
        }
        tracing::info!(adresse = %adresse, name = %info.name, "Server angemeldet");
        self.einfuegen(adresse, info, false);
        true
    }

    /// Meldet einen Server ab; feste Eintraege bleiben
    pub fn abmelden(&self, adresse: &SocketAddr) -> bool {
        let entfernt = self
            .eintraege
            .remove_if(adresse, |_, e| !e.permanent)
            .is_some();
        if entfernt {
            tracing::info!(adresse = %adresse, "Server abgemeldet");
        }
        entfernt
    }

    /// Verbucht eine Ping-Antwort
    pub fn ping_erfolgreich(&self, adresse: &SocketAddr) -> bool {
        match self.eintraege.get_mut(adresse) {
            Some(mut e) => {
                e.letzter_ping = Some(Instant::now());
                e.erreichbar = true;
                true
            }
            None => false,
        }
    }

    /// Markiert Server ohne Ping-Antwort seit `timeout` als unerreichbar
    pub fn unerreichbare_markieren(&self, timeout: Duration) -> usize {
        let mut markiert = 0;
        for mut e in self.eintraege.iter_mut() {
            let letzte = e.letzter_ping.unwrap_or(e.registriert_um);
            if e.erreichbar && letzte.elapsed() > timeout {
                e.erreichbar = false;
                markiert += 1;
                tracing::debug!(adresse = %e.adresse, "Server antwortet nicht auf Ping");
            }
        }
        markiert
    }

    /// Markiert Server, deren Anmeldung seit `timeout` nicht erneuert wurde
    ///
    /// Gilt ohne Ping-Modus; feste Eintraege melden sich nie an und bleiben
    /// erreichbar. Eine erneute Anmeldung hebt die Markierung auf.
    pub fn ohne_erneuerung_markieren(&self, timeout: Duration) -> usize {
        let mut markiert = 0;
        for mut e in self.eintraege.iter_mut() {
            if !e.permanent && e.erreichbar && e.registriert_um.elapsed() > timeout {
                e.erreichbar = false;
                markiert += 1;
                tracing::debug!(adresse = %e.adresse, "Server-Anmeldung nicht erneuert");
            }
        }
        markiert
    }

    /// Entfernt Server, deren letzte Anmeldung aelter als `timeout` ist
    pub fn veraltete_entfernen(&self, timeout: Duration) -> Vec<SocketAddr> {
        let veraltet: Vec<SocketAddr> = self
            .eintraege
            .iter()
            .filter(|e| !e.permanent && e.registriert_um.elapsed() > timeout)
            .map(|e| e.adresse)
            .collect();
        for adresse in &veraltet {
            self.eintraege.remove(adresse);
            tracing::info!(adresse = %adresse, "Server-Anmeldung abgelaufen");
        }
        veraltet
    }

    /// Liste fuer `ServerListe`-Antworten
    ///
    /// Unerreichbare Server nur mit `alle_anzeigen`.
    pub fn eintraege(&self, alle_anzeigen: bool) -> Vec<ServerListenEintrag> {
        let mut andere: Vec<VerzeichnisEintrag> = self
            .eintraege
            .iter()
            .filter(|e| alle_anzeigen || e.erreichbar)
            .map(|e| e.clone())
            .collect();
        andere.sort_by_key(|e| e.reihenfolge);

        let mut liste = Vec::with_capacity(andere.len() + 1);
        liste.push(self.eigener.clone());
        liste.extend(
            andere
                .iter()
                .take(MAX_LISTEN_EINTRAEGE - 1)
                .map(VerzeichnisEintrag::listen_eintrag),
        );
        liste
    }

    /// Adressen aller gelisteten Server (ohne den eigenen)
    pub fn ping_ziele(&self) -> Vec<SocketAddr> {
        self.eintraege.iter().map(|e| e.adresse).collect()
    }

    pub fn anzahl(&self) -> usize {
        self.eintraege.len()
    }

    fn einfuegen(&self, adresse: SocketAddr, info: ServerInfo, permanent: bool) {
        let reihenfolge = self.zaehler.fetch_add(1, Ordering::Relaxed);
        self.eintraege.insert(
            adresse,
            VerzeichnisEintrag {
                adresse,
                info,
                registriert_um: Instant::now(),
                letzter_ping: None,
                erreichbar: true,
                permanent,
                reihenfolge,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// VerzeichnisDienst
// ---------------------------------------------------------------------------

/// Datagramm, das der UDP-Task fuer den Dienst versenden soll
#[derive(Debug, Clone)]
pub struct VerzeichnisAuftrag {
    pub ziel: SocketAddr,
    pub nachricht: Nachricht,
}

/// Vom UDP-Task an den Dienst weitergereichte Nachrichten
#[derive(Debug, Clone)]
pub enum VerzeichnisEreignis {
    PingAntwort { von: SocketAddr },
    ServerListe {
        von: SocketAddr,
        eintraege: Vec<ServerListenEintrag>,
    },
}

#[derive(Debug, Clone)]
pub struct VerzeichnisConfig {
    /// Verzeichnis, bei dem sich dieser Server anmeldet
    pub verzeichnis_adresse: Option<SocketAddr>,
    pub eigene_info: ServerInfo,
    pub ping_server_in_liste: bool,
    pub registrierungs_intervall: Duration,
    pub ping_intervall: Duration,
}

impl VerzeichnisConfig {
    /// Anmeldungen ohne Erneuerung verfallen nach drei Intervallen
    pub fn registrierungs_timeout(&self) -> Duration {
        self.registrierungs_intervall * 3
    }

    pub fn ping_timeout(&self) -> Duration {
        self.ping_intervall * 3
    }

    /// Ohne Ping-Modus gilt ein Server nach zwei verpassten Anmeldungen als
    /// unerreichbar, lange bevor er aus der Liste faellt
    pub fn erneuerungs_timeout(&self) -> Duration {
        self.registrierungs_intervall * 2
    }
}

/// Kooperativer Task fuer Anmeldung und Pings
pub struct VerzeichnisDienst {
    config: VerzeichnisConfig,
    /// Eigene Liste, falls dieser Server selbst Verzeichnis ist
    liste: Option<Arc<ServerListe>>,
    /// Vom Verzeichnis gelernte Server (fuer den Ping-Modus)
    bekannte: Vec<SocketAddr>,
    auftraege: mpsc::Sender<VerzeichnisAuftrag>,
    start: Instant,
}

impl VerzeichnisDienst {
    pub fn neu(
        config: VerzeichnisConfig,
        liste: Option<Arc<ServerListe>>,
        auftraege: mpsc::Sender<VerzeichnisAuftrag>,
    ) -> Self {
        Self {
            config,
            liste,
            bekannte: Vec::new(),
            auftraege,
            start: Instant::now(),
        }
    }

    /// Laeuft bis `shutdown_rx` ein Signal sendet oder der Ereignis-Kanal endet
    pub async fn laufen(
        mut self,
        mut ereignisse: mpsc::Receiver<VerzeichnisEreignis>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut registrierung = tokio::time::interval(self.config.registrierungs_intervall);
        let mut ping = tokio::time::interval(self.config.ping_intervall);
        registrierung.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            verzeichnis = ?self.config.verzeichnis_adresse,
            ping_modus = self.config.ping_server_in_liste,
            "Verzeichnis-Dienst gestartet"
        );

        loop {
            tokio::select! {
                _ = registrierung.tick() => self.registrieren(),
                _ = ping.tick() => self.pingen(),
                ereignis = ereignisse.recv() => match ereignis {
                    Some(e) => self.ereignis_verarbeiten(e),
                    None => break,
                },
                _ = &mut shutdown_rx => {
                    self.abmelden();
                    break;
                }
            }
        }
        tracing::info!("Verzeichnis-Dienst beendet");
    }

    fn registrieren(&mut self) {
        if let Some(liste) = &self.liste {
            liste.veraltete_entfernen(self.config.registrierungs_timeout());
        }
        let Some(verzeichnis) = self.config.verzeichnis_adresse else {
            return;
        };
        self.senden(verzeichnis, Nachricht::ServerRegistrieren(self.config.eigene_info.clone()));
        if self.config.ping_server_in_liste {
            self.senden(verzeichnis, Nachricht::ServerListeAnfordern);
        }
    }

    fn pingen(&mut self) {
        if !self.config.ping_server_in_liste {
            if let Some(liste) = &self.liste {
                liste.ohne_erneuerung_markieren(self.config.erneuerungs_timeout());
            }
            return;
        }
        let ziele = match &self.liste {
            Some(liste) => {
                liste.unerreichbare_markieren(self.config.ping_timeout());
                liste.ping_ziele()
            }
            None => self.bekannte.clone(),
        };
        let zeitstempel_ms = self.start.elapsed().as_millis() as u64;
        for ziel in ziele {
            self.senden(ziel, Nachricht::Ping(Ping { zeitstempel_ms }));
        }
    }

    fn abmelden(&mut self) {
        if let Some(verzeichnis) = self.config.verzeichnis_adresse {
            self.senden(verzeichnis, Nachricht::ServerAbmelden);
        }
    }

    fn ereignis_verarbeiten(&mut self, ereignis: VerzeichnisEreignis) {
        match ereignis {
            VerzeichnisEreignis::PingAntwort { von } => {
                if let Some(liste) = &self.liste {
                    liste.ping_erfolgreich(&von);
                }
            }
            VerzeichnisEreignis::ServerListe { von, eintraege } => {
                if Some(von) != self.config.verzeichnis_adresse {
                    tracing::debug!(von = %von, "Server-Liste von fremder Adresse ignoriert");
                    return;
                }
                // Erster Eintrag ist das Verzeichnis selbst
                self.bekannte = eintraege
                    .iter()
                    .skip(1)
                    .map(|e| e.adresse)
                    .collect();
                tracing::debug!(anzahl = self.bekannte.len(), "Server-Liste vom Verzeichnis erhalten");
            }
        }
    }

    fn senden(&self, ziel: SocketAddr, nachricht: Nachricht) {
        if let Err(e) = self.auftraege.try_send(VerzeichnisAuftrag { ziel, nachricht }) {
            tracing::warn!(ziel = %ziel, "Verzeichnis-Auftrag verworfen: {}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
