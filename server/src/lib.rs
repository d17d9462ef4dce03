//! klangraum-server – Bibliotheks-Root
//!
//! Setzt die Crates zu einem laufenden Jam-Server zusammen und stellt den
//! Einstiegspunkt fuer Integrationstests bereit.

pub mod aufnahme;
pub mod config;

use anyhow::{Context, Result};
use aufnahme::PcmAufnahme;
use chrono::Utc;
use config::ServerConfig;
use klangraum_core::{SitzungsEreignis, TrennGrund};
use klangraum_observability::{
    observability_server_starten, HealthState, KlangraumMetrics, MetrikSchnappschuss,
};
use klangraum_protocol::control::ServerListenEintrag;
use klangraum_session::{
    historie_fuehren, Historie, JsonDateiSenke, JsonZeilenSpeicher, ServerListe, ServerStatus,
    SpeicherHistorie, StatusSenke, Teilnehmer, VerzeichnisConfig, VerzeichnisDienst,
};
use klangraum_voice::{
    AufnahmeWeiche, MixEngine, MixTakt, VerbindungsRegister, VoiceServer, VoiceServerConfig,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Takt fuer Metriken, Health und Status-Datei
const WARTUNGS_INTERVALL: Duration = Duration::from_secs(1);

/// Kapazitaet des Lebenszyklus-Broadcasts
const EREIGNIS_KAPAZITAET: usize = 256;

/// Noch nicht gestarteter Server
pub struct Server {
    pub config: ServerConfig,
}

/// Laufender Server, beendet mit [`LaufenderServer::herunterfahren`]
pub struct LaufenderServer {
    voice: Arc<VoiceServer>,
    takt: Option<MixTakt>,
    health: HealthState,
    empfang_shutdown: Option<oneshot::Sender<()>>,
    verzeichnis_shutdown: Option<oneshot::Sender<()>>,
    verzeichnis_task: Option<JoinHandle<()>>,
    hintergrund: Vec<JoinHandle<()>>,
    aufnahme_thread: Option<std::thread::JoinHandle<()>>,
    alle_trennen_beim_beenden: bool,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Startet alle Subsysteme und laeuft bis Ctrl-C
    pub async fn starten(self) -> Result<()> {
        let laufend = self.hochfahren().await?;
        tracing::info!("Server laeuft. Warte auf Shutdown-Signal (Ctrl-C)...");
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown-Signal empfangen, Server wird beendet");
        laufend.herunterfahren().await;
        Ok(())
    }

    /// Startet alle Subsysteme
    ///
    /// Reihenfolge:
    /// 1. Konfiguration pruefen
    /// 2. Mix-Engine (optional mit Aufnahme-Weiche)
    /// 3. UDP-Socket binden
    /// 4. Historie, Verzeichnis, Wartung
    /// 5. Mix-Takt und Empfangs-Loop
    /// 6. Observability-Server
    pub async fn hochfahren(self) -> Result<LaufenderServer> {
        let config = self.config;
        config.validieren()?;
        let kennung = config.server_kennung()?;

        tracing::info!(
            server_name = %kennung.eigene.name,
            udp = %config.udp_bind_adresse()?,
            max_kanaele = config.server.max_kanaele,
            frame_groesse = config.audio.frame_groesse,
            "Server startet"
        );

        let mut engine = MixEngine::neu(config.mix_config()?)?;
        let mut aufnahme_thread = None;
        if let Some(verzeichnis) = &config.aufnahme.verzeichnis {
            let ziel = PcmAufnahme::neu(verzeichnis)
                .with_context(|| format!("Aufnahme-Verzeichnis '{verzeichnis}' nicht nutzbar"))?;
            let (weiche, thread) = AufnahmeWeiche::starten(
                Box::new(ziel),
                klangraum_voice::aufnahme::STANDARD_KAPAZITAET,
            )?;
            engine = engine.mit_aufnahme(weiche);
            aufnahme_thread = Some(thread);
            tracing::info!(verzeichnis = %verzeichnis, "Aufnahme aktiv");
        }
        let engine = Arc::new(engine);

        let (ereignis_tx, _) = broadcast::channel::<SitzungsEreignis>(EREIGNIS_KAPAZITAET);
        let mut hintergrund = Vec::new();

        // Historie
        let tage = config.historie.tage;
        match &config.historie.datei {
            Some(datei) => {
                let historie = Arc::new(Historie::neu(JsonZeilenSpeicher::new(datei), tage)?);
                hintergrund.push(tokio::spawn(historie_fuehren::<JsonZeilenSpeicher>(
                    historie,
                    ereignis_tx.subscribe(),
                )));
                tracing::info!(datei = %datei, tage, "Verbindungs-Historie in Datei");
            }
            None => {
                let historie = Arc::new(Historie::neu(SpeicherHistorie::new(), tage)?);
                hintergrund.push(tokio::spawn(historie_fuehren::<SpeicherHistorie>(
                    historie,
                    ereignis_tx.subscribe(),
                )));
            }
        }

        let voice_config = VoiceServerConfig {
            send_queue_groesse: config.netzwerk.sende_queue,
            verbindungs_timeout: config.verbindungs_timeout(),
            willkommen: config.server.willkommen.clone(),
            alle_anzeigen: config.verzeichnis.alle_anzeigen,
            ..VoiceServerConfig::neu(config.udp_bind_adresse()?)
        };
        let mut voice = VoiceServer::binden(
            voice_config,
            Arc::clone(&engine),
            VerbindungsRegister::neu(),
            ereignis_tx.clone(),
        )
        .await
        .context("UDP-Socket konnte nicht gebunden werden")?;
        let lokale_adresse = voice.lokale_adresse()?;

        // Verzeichnis
        let liste = if config.verzeichnis.ist_verzeichnis {
            let liste = Arc::new(ServerListe::neu(ServerListenEintrag {
                adresse: lokale_adresse,
                name: kennung.eigene.name.clone(),
                stadt: kennung.eigene.stadt.clone(),
                land: kennung.eigene.land,
                kanaele: config.server.max_kanaele,
            }));
            for eintrag in &kennung.feste_eintraege {
                liste.permanent_eintragen(eintrag);
            }
            tracing::info!(feste = kennung.feste_eintraege.len(), "Server ist Verzeichnis");
            Some(liste)
        } else {
            None
        };

        let verzeichnis_adresse = config.verzeichnis_adresse()?;
        let dienst_noetig = verzeichnis_adresse.is_some() || liste.is_some();
        let (verzeichnis_ereignisse, dienst_teile) = if dienst_noetig {
            let (auftrag_tx, auftrag_rx) = mpsc::channel(256);
            let (verz_tx, verz_rx) = mpsc::channel(64);
            let dienst = VerzeichnisDienst::neu(
                VerzeichnisConfig {
                    verzeichnis_adresse,
                    eigene_info: kennung.eigene.clone(),
                    ping_server_in_liste: config.verzeichnis.ping_server_in_liste,
                    registrierungs_intervall: Duration::from_secs(
                        config.verzeichnis.registrierungs_intervall_s,
                    ),
                    ping_intervall: Duration::from_secs(config.verzeichnis.ping_intervall_s),
                },
                liste.clone(),
                auftrag_tx,
            );
            (Some(verz_tx), Some((dienst, auftrag_rx, verz_rx)))
        } else {
            (None, None)
        };
        voice.verzeichnis_anbinden(liste.clone(), verzeichnis_ereignisse);
        let voice = Arc::new(voice);

        let mut verzeichnis_shutdown = None;
        let mut verzeichnis_task = None;
        if let Some((dienst, auftrag_rx, verz_rx)) = dienst_teile {
            hintergrund.push(voice.verzeichnis_auftraege_weiterleiten(auftrag_rx));
            let (tx, rx) = oneshot::channel();
            verzeichnis_shutdown = Some(tx);
            verzeichnis_task = Some(tokio::spawn(dienst.laufen(verz_rx, rx)));
        }

        // Mix-Takt und Empfang
        let takt = MixTakt::starten(Arc::clone(&engine), voice.sender())
            .context("Mix-Takt konnte nicht gestartet werden")?;
        let health = HealthState::neu(config.server.max_kanaele as usize);
        health.mix_takt_setzen(true);

        let (empfang_tx, empfang_rx) = oneshot::channel();
        let v = Arc::clone(&voice);
        hintergrund.push(tokio::spawn(async move {
            v.empfangs_loop_starten(empfang_rx).await;
        }));

        // Wartung: Metriken, Health, Status-Datei
        let metriken = KlangraumMetrics::neu()?;
        let wartung = Wartung {
            voice: Arc::clone(&voice),
            liste,
            takt_verworfen: takt.verworfen_zaehler(),
            metriken: metriken.clone(),
            health: health.clone(),
            status: config.status.datei.as_ref().map(JsonDateiSenke::new),
            name: kennung.eigene.name.clone(),
            max_kanaele: config.server.max_kanaele,
        };
        hintergrund.push(tokio::spawn(wartung.laufen()));

        if config.observability.aktiviert {
            let adresse = config.observability_bind_adresse()?;
            let h = health.clone();
            hintergrund.push(tokio::spawn(async move {
                if let Err(e) = observability_server_starten(adresse, metriken, h).await {
                    tracing::error!("Observability-Server beendet: {:#}", e);
                }
            }));
        }

        tracing::info!(adresse = %lokale_adresse, "Server bereit");
        Ok(LaufenderServer {
            voice,
            takt: Some(takt),
            health,
            empfang_shutdown: Some(empfang_tx),
            verzeichnis_shutdown,
            verzeichnis_task,
            hintergrund,
            aufnahme_thread,
            alle_trennen_beim_beenden: config.server.alle_trennen_beim_beenden,
        })
    }
}

impl LaufenderServer {
    pub fn udp_adresse(&self) -> Result<SocketAddr> {
        Ok(self.voice.lokale_adresse()?)
    }

    pub fn voice(&self) -> &Arc<VoiceServer> {
        &self.voice
    }

    /// Geordnetes Herunterfahren
    ///
    /// Trennt bei Bedarf alle Clients und meldet sich beim Verzeichnis ab.
    /// Nach dem Mix-Takt wird die Aufnahme abgeschlossen, zuletzt der Empfang.
    pub async fn herunterfahren(mut self) {
        if self.alle_trennen_beim_beenden {
            let n = self.voice.alle_trennen(TrennGrund::ServerBeendet);
            tracing::info!(getrennt = n, "Alle Clients getrennt");
        }

        if let Some(tx) = self.verzeichnis_shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.verzeichnis_task.take() {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                tracing::warn!("Verzeichnis-Dienst reagiert nicht auf Shutdown");
            }
        }

        // Trennen- und Abmelde-Datagramme aus der Sende-Queue lassen
        tokio::time::sleep(Duration::from_millis(50)).await;

        self.health.mix_takt_setzen(false);
        if let Some(takt) = self.takt.take() {
            if tokio::task::spawn_blocking(move || takt.stoppen()).await.is_err() {
                tracing::error!("Mix-Takt konnte nicht gestoppt werden");
            }
        }

        // Nach dem letzten Tick kommen keine Frames mehr, Rest auf Platte bringen
        if let Some(thread) = self.aufnahme_thread.take() {
            let engine = Arc::clone(self.voice.engine());
            let beendet = tokio::task::spawn_blocking(move || {
                engine.aufnahme_beenden();
                thread.join()
            });
            match beendet.await {
                Ok(Ok(())) => tracing::info!("Aufnahme abgeschlossen"),
                _ => tracing::error!("Aufnahme-Thread ist abgestuerzt"),
            }
        }

        if let Some(tx) = self.empfang_shutdown.take() {
            let _ = tx.send(());
        }
        for task in self.hintergrund.drain(..) {
            task.abort();
        }
        tracing::info!("Server beendet");
    }
}

/// Periodische Uebertragung der Zaehler nach Prometheus, Health und Status
struct Wartung {
    voice: Arc<VoiceServer>,
    liste: Option<Arc<ServerListe>>,
    takt_verworfen: Arc<AtomicU64>,
    metriken: KlangraumMetrics,
    health: HealthState,
    status: Option<JsonDateiSenke>,
    name: String,
    max_kanaele: u16,
}

impl Wartung {
    async fn laufen(self) {
        let mut intervall = tokio::time::interval(WARTUNGS_INTERVALL);
        intervall.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            intervall.tick().await;
            self.durchlauf().await;
        }
    }

    async fn durchlauf(&self) {
        let mix = self.voice.engine().statistik();
        let udp = self.voice.statistik();
        let verbunden = self.voice.register().anzahl();

        self.metriken.uebernehmen(&MetrikSchnappschuss {
            verbunden,
            verzeichnis_server: self.liste.as_ref().map_or(0, |l| l.anzahl()),
            mix_ticks: mix.ticks,
            ueberlast_ticks: mix.ueberlast_ticks,
            abgeworfene_eingaenge: mix.abgeworfene_eingaenge,
            verdeckte_frames: mix.verdeckte_frames,
            uebersteuerte_samples: mix.uebersteuerte_samples,
            verworfene_datagramme: udp.verworfen,
            sende_verworfen: udp.sende_verworfen + self.takt_verworfen.load(Ordering::Relaxed),
            jitter_ms: self
                .voice
                .engine()
                .jitter_ms()
                .into_iter()
                .map(|(_, ms)| ms)
                .collect(),
        });
        self.health.verbunden_setzen(verbunden);

        if let Some(senke) = &self.status {
            let status = status_erstellen(&self.voice, &self.name, self.max_kanaele);
            if let Err(e) = senke.schreiben(&status).await {
                tracing::warn!(pfad = %senke.pfad().display(), "Status-Datei nicht geschrieben: {}", e);
            }
        }
    }
}

/// Schnappschuss der verbundenen Teilnehmer, nach Slot sortiert
pub fn status_erstellen(voice: &VoiceServer, name: &str, max_kanaele: u16) -> ServerStatus {
    let teilnehmer: Vec<Teilnehmer> = voice
        .register()
        .schnappschuss()
        .into_iter()
        .map(|v| Teilnehmer {
            slot: v.slot.0,
            name: if v.kanal_info.name.is_empty() {
                v.name
            } else {
                v.kanal_info.name
            },
            stadt: v.kanal_info.stadt,
            land: v.kanal_info.land,
        })
        .collect();
    ServerStatus {
        name: name.to_string(),
        zeitpunkt: Utc::now(),
        verbunden: teilnehmer.len(),
        max_kanaele,
        teilnehmer,
    }
}
