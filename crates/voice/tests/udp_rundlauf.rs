//! Ende-zu-Ende-Tests: zwei Clients ueber einen echten UDP-Server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use klangraum_core::TrennGrund;
use klangraum_protocol::codec::{CodecTyp, FrameFormat, FrameGroesse, KanalAnzahl};
use klangraum_protocol::control::{ServerInfo, ServerListenEintrag};
use klangraum_protocol::Nachricht;
use klangraum_session::ServerListe;
use klangraum_voice::{
    ClientConfig, ClientEreignis, JitterBufferConfig, JitterBufferModus, KlangraumClient,
    MixConfig, MixEngine, MixTakt, VerbindungsRegister, VoiceServer, VoiceServerConfig,
};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};

fn format() -> FrameFormat {
    FrameFormat::neu(FrameGroesse::Samples128, KanalAnzahl::Mono, CodecTyp::Pcm16)
}

fn jitter() -> JitterBufferConfig {
    JitterBufferConfig {
        modus: JitterBufferModus::Fixed,
        start_ziel: 2,
        min_ziel: 1,
        ..JitterBufferConfig::default()
    }
}

struct TestServer {
    server: Arc<VoiceServer>,
    adresse: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    takt: Option<MixTakt>,
}

impl TestServer {
    async fn starten(liste: Option<Arc<ServerListe>>) -> Self {
        let engine = Arc::new(
            MixEngine::neu(MixConfig {
                max_kanaele: 4,
                jitter: jitter(),
                ..MixConfig::default()
            })
            .unwrap(),
        );
        let (ereignisse, _) = broadcast::channel(64);
        let mut server = VoiceServer::binden(
            VoiceServerConfig::neu("127.0.0.1:0".parse().unwrap()),
            Arc::clone(&engine),
            VerbindungsRegister::neu(),
            ereignisse,
        )
        .await
        .unwrap();
        server.verzeichnis_anbinden(liste, None);
        let adresse = server.lokale_adresse().unwrap();
        let server = Arc::new(server);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let s = Arc::clone(&server);
        tokio::spawn(async move { s.empfangs_loop_starten(shutdown_rx).await });
        let takt = MixTakt::starten(engine, server.sender()).unwrap();

        Self {
            server,
            adresse,
            shutdown: Some(shutdown_tx),
            takt: Some(takt),
        }
    }

    fn stoppen(mut self) {
        if let Some(takt) = self.takt.take() {
            takt.stoppen();
        }
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn client(server: SocketAddr, name: &str) -> (KlangraumClient, mpsc::Receiver<ClientEreignis>) {
    let mut config = ClientConfig::neu(server, name, format());
    config.jitter = jitter();
    let (client, mut ereignisse) = KlangraumClient::verbinden(config).await.unwrap();

    let bestaetigt = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ereignisse.recv().await {
                Some(ClientEreignis::Bestaetigt { .. }) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(bestaetigt, "{name} erhaelt keine Bestaetigung");
    (client, ereignisse)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zwei_clients_hoeren_einander() {
    let server = TestServer::starten(None).await;
    let (mut anna, _anna_ev) = client(server.adresse, "Anna").await;
    let (mut bert, _bert_ev) = client(server.adresse, "Bert").await;
    assert_eq!(server.server.register().anzahl(), 2);

    let ton = vec![1000i16; 128];
    let stille = vec![0i16; 128];
    let mut aus_anna = vec![0i16; 128];
    let mut aus_bert = vec![0i16; 128];

    let frist = Instant::now() + Duration::from_secs(3);
    let mut bert_hoert_anna = false;
    while Instant::now() < frist && !bert_hoert_anna {
        anna.audio_verarbeiten(&ton, &mut aus_anna).unwrap();
        bert.audio_verarbeiten(&stille, &mut aus_bert).unwrap();
        bert_hoert_anna = aus_bert.contains(&1000);
        // Anna hoert sich selbst nicht
        assert!(aus_anna.iter().all(|&s| s == 0));
        tokio::time::sleep(Duration::from_micros(2_667)).await;
    }
    assert!(bert_hoert_anna, "Annas Signal kommt bei Bert nicht an");

    anna.trennen().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.server.register().anzahl(), 1);

    server.stoppen();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_beenden_trennt_clients() {
    let server = TestServer::starten(None).await;
    let (_anna, mut ereignisse) = client(server.adresse, "Anna").await;

    assert_eq!(server.server.alle_trennen(TrennGrund::ServerBeendet), 1);

    let grund = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(ClientEreignis::Getrennt { grund }) = ereignisse.recv().await {
                return grund;
            }
        }
    })
    .await
    .expect("Trennung kommt beim Client an");
    assert_eq!(grund, TrennGrund::ServerBeendet);

    server.stoppen();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_verzeichnis_listet_angemeldete_server() {
    let eigener = ServerListenEintrag {
        adresse: "127.0.0.1:22124".parse().unwrap(),
        name: "Verzeichnis".into(),
        stadt: "Wien".into(),
        land: 40,
        kanaele: 4,
    };
    let liste = Arc::new(ServerListe::neu(eigener));
    let server = TestServer::starten(Some(Arc::clone(&liste))).await;

    let anderer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let anmeldung = Nachricht::ServerRegistrieren(ServerInfo {
        name: "Keller".into(),
        stadt: "Linz".into(),
        land: 40,
        max_kanaele: 8,
    });
    anderer
        .send_to(&anmeldung.encode().unwrap(), server.adresse)
        .await
        .unwrap();
    anderer
        .send_to(&Nachricht::ServerListeAnfordern.encode().unwrap(), server.adresse)
        .await
        .unwrap();

    let mut buf = vec![0u8; 65_536];
    let eintraege = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let (len, _) = anderer.recv_from(&mut buf).await.unwrap();
            if let Ok(Nachricht::ServerListe(e)) = Nachricht::decode(&buf[..len]) {
                return e;
            }
        }
    })
    .await
    .expect("Server-Liste erwartet");

    let namen: Vec<_> = eintraege.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(namen, vec!["Verzeichnis", "Keller"]);
    assert_eq!(eintraege[1].adresse, anderer.local_addr().unwrap());

    server.stoppen();
}
