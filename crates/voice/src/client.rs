//! Client-Engine
//!
//! Verbindet sich mit einem Jam-Server und haengt an den Audio-Treiber:
//!
//! ```text
//! Treiber-Callback (audio_verarbeiten)
//!   Eingabe --> BlockAdapter --> Encode --> try_send --> Sende-Task --> UDP
//!   Ausgabe <-- BlockAdapter <-- Decode/Verdecken <-- Jitter Buffer <-- Empfangs-Task <-- UDP
//! ```
//!
//! Steuer-Nachrichten des Servers kommen als [`ClientEreignis`] ueber einen
//! `mpsc`-Kanal. Der Callback wartet nie: volle Kanaele verwerfen.

use crate::jitter_buffer::{AdaptiveJitterBuffer, JitterBufferConfig, TickErgebnis};
use futures_util::{SinkExt, StreamExt};
use klangraum_audio::{codec_erstellen, AudioFrame, BlockAdapter, FrameCodec, FrameDecoder};
use klangraum_core::{KlangraumError, Result, SlotId, TrennGrund};
use klangraum_protocol::control::{
    ChatNachricht, GainSetzen, KanalEintrag, KanalInfo, LizenzTyp, Ping, Trennen, Verbinden,
};
use klangraum_protocol::{AudioPaket, DatagrammCodec, FrameFormat, Nachricht};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::udp::UdpFramed;

/// Kapazitaet der Sende-Queue in Datagrammen
const SENDE_QUEUE: usize = 256;

/// Kapazitaet des Ereignis-Kanals
const EREIGNIS_QUEUE: usize = 64;

// ---------------------------------------------------------------------------
// Konfiguration & Ereignisse
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    /// Lokale Bind-Adresse (Port 0 = beliebig)
    pub bind_addr: SocketAddr,
    pub name: String,
    pub format: FrameFormat,
    /// Samples pro Treiber-Callback (interleavt)
    pub treiber_block: usize,
    pub jitter: JitterBufferConfig,
}

impl ClientConfig {
    pub fn neu(server: SocketAddr, name: impl Into<String>, format: FrameFormat) -> Self {
        let bind_addr = if server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        Self {
            server,
            bind_addr,
            name: name.into(),
            format,
            treiber_block: format.samples_gesamt(),
            jitter: JitterBufferConfig::default(),
        }
    }
}

/// Vom Server ausgeloeste Ereignisse
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEreignis {
    Bestaetigt {
        slot: SlotId,
        willkommen: Option<String>,
    },
    LizenzErforderlich(LizenzTyp),
    KanalListe(Vec<KanalEintrag>),
    Chat(String),
    PingAntwort { rtt: Duration },
    Gekickt { grund: Option<String> },
    /// Server hat getrennt oder abgelehnt
    Getrennt { grund: TrennGrund },
}

enum ClientAuftrag {
    Senden(Nachricht),
    Beenden,
}

// ---------------------------------------------------------------------------
// KlangraumClient
// ---------------------------------------------------------------------------

pub struct KlangraumClient {
    config: ClientConfig,
    auftraege: mpsc::Sender<ClientAuftrag>,
    jitter: Arc<Mutex<AdaptiveJitterBuffer>>,
    encoder: Box<dyn FrameCodec>,
    decoder: FrameDecoder,
    eingang: BlockAdapter,
    ausgang: BlockAdapter,
    sende_seq: u32,
    start: Instant,
    lokal: SocketAddr,
    sende_task: Option<JoinHandle<()>>,
    empfangs_task: Option<JoinHandle<()>>,
}

impl KlangraumClient {
    /// Bindet einen Socket, sendet den Handshake und startet die Tasks
    pub async fn verbinden(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ClientEreignis>)> {
        if config.treiber_block == 0 || config.treiber_block % config.format.kanaele.anzahl() != 0
        {
            return Err(KlangraumError::Konfiguration(format!(
                "Treiber-Block {} passt nicht zu {} Kanaelen",
                config.treiber_block,
                config.format.kanaele.anzahl()
            )));
        }

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let lokal = socket.local_addr()?;
        let start = Instant::now();

        let jitter = Arc::new(Mutex::new(AdaptiveJitterBuffer::neu(JitterBufferConfig {
            frame_dauer: config.format.frame_dauer(),
            ..config.jitter.clone()
        })));

        let (auftrag_tx, auftrag_rx) = mpsc::channel(SENDE_QUEUE);
        let (ereignis_tx, ereignis_rx) = mpsc::channel(EREIGNIS_QUEUE);

        let sende_task = tokio::spawn(sende_loop(
            UdpFramed::new(Arc::clone(&socket), DatagrammCodec::new()),
            config.server,
            auftrag_rx,
        ));
        let empfangs_task = tokio::spawn(empfangs_loop(
            UdpFramed::new(socket, DatagrammCodec::new()),
            config.server,
            Arc::clone(&jitter),
            ereignis_tx,
            start,
        ));

        let frame = config.format.samples_gesamt();
        let kapazitaet = 4 * frame.max(config.treiber_block);
        let adapter = |block| {
            BlockAdapter::neu(block, kapazitaet).map_err(|e| KlangraumError::Audio(e.to_string()))
        };

        let client = Self {
            encoder: codec_erstellen(config.format),
            decoder: FrameDecoder::neu(config.format),
            eingang: adapter(frame)?,
            ausgang: adapter(config.treiber_block)?,
            config,
            auftraege: auftrag_tx,
            jitter,
            sende_seq: 0,
            start,
            lokal,
            sende_task: Some(sende_task),
            empfangs_task: Some(empfangs_task),
        };

        client.senden(Nachricht::Verbinden(Verbinden {
            client_name: client.config.name.clone(),
            format: client.config.format,
        }))?;
        tracing::info!(server = %client.config.server, lokal = %lokal, "Verbindung angefragt");

        Ok((client, ereignis_rx))
    }

    pub fn lokale_adresse(&self) -> SocketAddr {
        self.lokal
    }

    pub fn format(&self) -> FrameFormat {
        self.config.format
    }

    /// Treiber-Callback: `eingabe` senden, `ausgabe` mit dem Mix fuellen
    ///
    /// Beide Puffer haben `treiber_block` interleavte Samples. Blockiert nie.
    pub fn audio_verarbeiten(&mut self, eingabe: &[i16], ausgabe: &mut [i16]) -> Result<()> {
        let block = self.config.treiber_block;
        if eingabe.len() != block || ausgabe.len() != block {
            return Err(KlangraumError::Audio(format!(
                "Treiber-Puffer {}/{} statt {block} Samples",
                eingabe.len(),
                ausgabe.len()
            )));
        }

        // Senden
        self.eingang.einspeisen(eingabe);
        while let Some(samples) = self.eingang.block_entnehmen() {
            let Some(frame) = AudioFrame::neu(self.config.format.kanaele, samples) else {
                continue;
            };
            let nutzdaten = self
                .encoder
                .encode(&frame)
                .map_err(|e| KlangraumError::Audio(e.to_string()))?;
            let paket = AudioPaket::neu(self.sende_seq, nutzdaten);
            self.sende_seq = self.sende_seq.wrapping_add(1);
            if self
                .auftraege
                .try_send(ClientAuftrag::Senden(Nachricht::Audio(paket)))
                .is_err()
            {
                tracing::trace!("Sende-Queue voll, Audio-Frame verworfen");
            }
        }

        // Wiedergabe
        while self.ausgang.bloecke_verfuegbar() == 0 {
            let tick = self.jitter.lock().tick();
            let frame = match tick {
                TickErgebnis::Priming => AudioFrame::stille(&self.config.format),
                TickErgebnis::Frame(paket) => {
                    self.decoder.dekodieren(Some(&paket.nutzdaten)).into_frame()
                }
                TickErgebnis::Fehlt { .. } => self.decoder.dekodieren(None).into_frame(),
            };
            self.ausgang.einspeisen(frame.samples());
        }
        if !self.ausgang.block_lesen(ausgabe) {
            ausgabe.fill(0);
        }
        Ok(())
    }

    /// Geschaetzter Jitter der Rueckrichtung in Millisekunden
    pub fn jitter_ms(&self) -> f64 {
        self.jitter.lock().jitter_ms()
    }

    pub fn chat_senden(&self, text: impl Into<String>) -> Result<()> {
        let chat = ChatNachricht { text: text.into() };
        chat.pruefen().map_err(KlangraumError::UngueltigeNachricht)?;
        self.senden(Nachricht::Chat(chat))
    }

    pub fn kanal_info_senden(&self, info: KanalInfo) -> Result<()> {
        info.pruefen().map_err(KlangraumError::UngueltigeNachricht)?;
        self.senden(Nachricht::KanalInfo(info))
    }

    /// Lautstaerke und Panorama von `quelle` im eigenen Mix
    pub fn gain_setzen(&self, quelle: SlotId, gain: f32, pan: f32) -> Result<()> {
        let g = GainSetzen {
            quelle: quelle.0,
            gain,
            pan,
        };
        g.pruefen().map_err(KlangraumError::UngueltigeNachricht)?;
        self.senden(Nachricht::GainSetzen(g))
    }

    pub fn lizenz_akzeptieren(&self) -> Result<()> {
        self.senden(Nachricht::LizenzAkzeptiert)
    }

    /// Misst die Umlaufzeit; die Antwort kommt als `ClientEreignis::PingAntwort`
    pub fn ping_senden(&self) -> Result<()> {
        let zeitstempel_ms = self.start.elapsed().as_millis() as u64;
        self.senden(Nachricht::Ping(Ping { zeitstempel_ms }))
    }

    /// Meldet sich ab und wartet, bis die Abmeldung versendet ist
    pub async fn trennen(mut self) {
        let _ = self.senden(Nachricht::Trennen(Trennen {
            grund: TrennGrund::ClientBeendet,
        }));
        let _ = self.auftraege.send(ClientAuftrag::Beenden).await;
        if let Some(task) = self.sende_task.take() {
            let _ = task.await;
        }
        tracing::info!(server = %self.config.server, "Verbindung getrennt");
    }

    fn senden(&self, nachricht: Nachricht) -> Result<()> {
        self.auftraege
            .try_send(ClientAuftrag::Senden(nachricht))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    KlangraumError::Verbindung("Sende-Queue voll".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    KlangraumError::Getrennt("Sende-Task beendet".into())
                }
            })
    }
}

impl Drop for KlangraumClient {
    fn drop(&mut self) {
        if let Some(task) = self.empfangs_task.take() {
            task.abort();
        }
        if let Some(task) = self.sende_task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

type Framed = UdpFramed<DatagrammCodec, Arc<UdpSocket>>;

async fn sende_loop(
    mut framed: Framed,
    server: SocketAddr,
    mut auftraege: mpsc::Receiver<ClientAuftrag>,
) {
    while let Some(auftrag) = auftraege.recv().await {
        match auftrag {
            ClientAuftrag::Senden(nachricht) => {
                if let Err(e) = framed.send((nachricht, server)).await {
                    tracing::debug!(server = %server, "Senden fehlgeschlagen: {}", e);
                }
            }
            ClientAuftrag::Beenden => break,
        }
    }
    tracing::debug!("Client-Sende-Task beendet");
}

async fn empfangs_loop(
    mut framed: Framed,
    server: SocketAddr,
    jitter: Arc<Mutex<AdaptiveJitterBuffer>>,
    ereignisse: mpsc::Sender<ClientEreignis>,
    start: Instant,
) {
    while let Some(ergebnis) = framed.next().await {
        let (nachricht, absender) = match ergebnis {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Ungueltiges Datagramm: {}", e);
                continue;
            }
        };
        if absender != server {
            tracing::trace!(absender = %absender, "Datagramm von fremder Adresse");
            continue;
        }

        let ereignis = match nachricht {
            Nachricht::Audio(paket) => {
                jitter.lock().einfuegen(paket, Instant::now());
                continue;
            }
            Nachricht::VerbindungBestaetigt(b) => {
                tracing::info!(slot = b.slot, "Verbindung bestaetigt");
                ClientEreignis::Bestaetigt {
                    slot: SlotId(b.slot),
                    willkommen: b.willkommen,
                }
            }
            Nachricht::LizenzErforderlich(typ) => ClientEreignis::LizenzErforderlich(typ),
            Nachricht::KanalListe(liste) => ClientEreignis::KanalListe(liste),
            Nachricht::Chat(chat) => ClientEreignis::Chat(chat.text),
            Nachricht::PingAntwort(ping) => {
                let jetzt = start.elapsed().as_millis() as u64;
                ClientEreignis::PingAntwort {
                    rtt: Duration::from_millis(jetzt.saturating_sub(ping.zeitstempel_ms)),
                }
            }
            Nachricht::Kick(kick) => {
                tracing::warn!(grund = ?kick.grund, "Vom Server entfernt");
                ClientEreignis::Gekickt { grund: kick.grund }
            }
            Nachricht::Trennen(t) => {
                tracing::info!(grund = %t.grund, "Server hat getrennt");
                ClientEreignis::Getrennt { grund: t.grund }
            }
            andere => {
                tracing::debug!(typ = ?andere.typ(), "Unerwartete Nachricht vom Server");
                continue;
            }
        };
        if ereignisse.try_send(ereignis).is_err() {
            tracing::debug!("Client-Ereignis verworfen");
        }
    }
    tracing::debug!("Client-Empfangs-Task beendet");
}

#[cfg(test)]
mod tests {
    use super::*;
    use klangraum_protocol::codec::{CodecTyp, FrameGroesse, KanalAnzahl};

    fn format() -> FrameFormat {
        FrameFormat::neu(FrameGroesse::Samples64, KanalAnzahl::Stereo, CodecTyp::ImaAdpcm)
    }

    #[tokio::test]
    async fn handshake_geht_an_den_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ClientConfig::neu(server.local_addr().unwrap(), "Anna", format());
        let (client, _ereignisse) = KlangraumClient::verbinden(config).await.unwrap();

        let mut buf = [0u8; 2048];
        let (len, von) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(von.port(), client.lokale_adresse().port());
        match Nachricht::decode(&buf[..len]).unwrap() {
            Nachricht::Verbinden(v) => {
                assert_eq!(v.client_name, "Anna");
                assert_eq!(v.format, format());
            }
            andere => panic!("Handshake erwartet, erhalten {andere:?}"),
        }
    }

    #[tokio::test]
    async fn callback_liefert_ohne_server_stille() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = ClientConfig::neu(server.local_addr().unwrap(), "Bert", format());
        config.treiber_block = 96;
        let (mut client, _ereignisse) = KlangraumClient::verbinden(config).await.unwrap();

        let eingabe = vec![500i16; 96];
        let mut ausgabe = vec![1i16; 96];
        for _ in 0..10 {
            client.audio_verarbeiten(&eingabe, &mut ausgabe).unwrap();
            assert!(ausgabe.iter().all(|&s| s == 0));
        }
        assert!(client.audio_verarbeiten(&eingabe[..10], &mut ausgabe).is_err());
    }

    #[tokio::test]
    async fn ungueltige_treiber_groesse() {
        let mut config = ClientConfig::neu("127.0.0.1:9".parse().unwrap(), "X", format());
        config.treiber_block = 3;
        assert!(KlangraumClient::verbinden(config).await.is_err());
    }
}
