//! Wire-Format fuer UDP-Datagramme
//!
//! Jedes Datagramm traegt genau eine Nachricht.
//!
//! ## Datagramm-Format
//!
//! ```text
//! Offset  Len  Beschreibung
//! ------  ---  -----------
//!  0       2   Kennung "KR"
//!  2       1   Protokollversion
//!  3       1   Nachrichtentyp (siehe `NachrichtenTyp`)
//!  4       2   Payload-Laenge N (big-endian)
//!  6       N   Payload (Audio binaer, sonst JSON)
//!  6+N     4   CRC32 ueber Bytes 0..6+N (big-endian)
//! ```
//!
//! Jedes Datagramm mit falscher Kennung, Version, Laenge, Pruefsumme, unbekanntem
//! Typ oder ungueltiger Payload wird mit einem `WireFehler` abgelehnt. Der
//! Empfaenger verwirft es und protokolliert, nichts davon ist fatal.

use crate::control::{
    ChatNachricht, GainSetzen, KanalEintrag, KanalInfo, Kick, LizenzTyp, Ping, ServerInfo,
    ServerListenEintrag, Trennen, Verbinden, VerbindungBestaetigt, MAX_LISTEN_EINTRAEGE,
};
use crate::voice::AudioPaket;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

/// Kennung am Anfang jedes Datagramms
pub const KENNUNG: [u8; 2] = *b"KR";

/// Aktuelle Protokollversion
pub const PROTOKOLL_VERSION: u8 = 1;

/// Groesse des Kopfes (Kennung, Version, Typ, Laenge)
pub const KOPF_LAENGE: usize = 6;

/// Groesse der Pruefsumme am Ende
pub const CRC_LAENGE: usize = 4;

/// Groesste UDP-Nutzlast ueber IPv4
pub const MAX_DATAGRAMM_LAENGE: usize = 65_507;

/// Groesste Payload eines Datagramms
pub const MAX_PAYLOAD_LAENGE: usize = MAX_DATAGRAMM_LAENGE - KOPF_LAENGE - CRC_LAENGE;

// ---------------------------------------------------------------------------
// Fehler
// ---------------------------------------------------------------------------

/// Grund fuer die Ablehnung eines Datagramms
#[derive(Debug, Error)]
pub enum WireFehler {
    #[error("Datagramm zu kurz: {0} Bytes")]
    ZuKurz(usize),

    #[error("Falsche Kennung: {0:02x?}")]
    FalscheKennung([u8; 2]),

    #[error("Protokollversion nicht unterstuetzt: {0}")]
    Version(u8),

    #[error("Unbekannter Nachrichtentyp: {0}")]
    UnbekannterTyp(u8),

    #[error("Laengenfeld passt nicht: angegeben {angegeben}, vorhanden {vorhanden}")]
    LaengeFalsch { angegeben: usize, vorhanden: usize },

    #[error("Pruefsumme falsch: erwartet {erwartet:08x}, berechnet {berechnet:08x}")]
    Pruefsumme { erwartet: u32, berechnet: u32 },

    #[error("Payload zu kurz: erwartet {erwartet}, erhalten {erhalten}")]
    PayloadZuKurz { erwartet: usize, erhalten: usize },

    #[error("Payload zu gross: {0} Bytes")]
    PayloadZuGross(usize),

    #[error("JSON-Payload ungueltig: {0}")]
    Json(String),

    #[error("Nachricht ungueltig: {0}")]
    Ungueltig(String),

    #[error("IO-Fehler: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// NachrichtenTyp
// ---------------------------------------------------------------------------

/// Typ-Byte im Datagramm-Kopf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NachrichtenTyp {
    Audio = 0,
    KanalInfo = 1,
    Chat = 2,
    Ping = 3,
    PingAntwort = 4,
    Verbinden = 5,
    Trennen = 6,
    ServerListe = 7,
    ServerListeAnfordern = 8,
    LizenzErforderlich = 9,
    LizenzAkzeptiert = 10,
    VerbindungBestaetigt = 11,
    Kick = 12,
    GainSetzen = 13,
    KanalListe = 14,
    ServerRegistrieren = 15,
    ServerAbmelden = 16,
}

impl NachrichtenTyp {
    /// Konvertiert ein Byte in einen `NachrichtenTyp`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        let typ = match byte {
            0 => Self::Audio,
            1 => Self::KanalInfo,
            2 => Self::Chat,
            3 => Self::Ping,
            4 => Self::PingAntwort,
            5 => Self::Verbinden,
            6 => Self::Trennen,
            7 => Self::ServerListe,
            8 => Self::ServerListeAnfordern,
            9 => Self::LizenzErforderlich,
            10 => Self::LizenzAkzeptiert,
            11 => Self::VerbindungBestaetigt,
            12 => Self::Kick,
            13 => Self::GainSetzen,
            14 => Self::KanalListe,
            15 => Self::ServerRegistrieren,
            16 => Self::ServerAbmelden,
            _ => return None,
        };
        Some(typ)
    }
}

// ---------------------------------------------------------------------------
// Nachricht
// ---------------------------------------------------------------------------

/// Alle Nachrichten, die ueber ein Datagramm laufen koennen
#[derive(Debug, Clone, PartialEq)]
pub enum Nachricht {
    Audio(AudioPaket),
    KanalInfo(KanalInfo),
    Chat(ChatNachricht),
    Ping(Ping),
    PingAntwort(Ping),
    Verbinden(Verbinden),
    Trennen(Trennen),
    ServerListe(Vec<ServerListenEintrag>),
    ServerListeAnfordern,
    LizenzErforderlich(LizenzTyp),
    LizenzAkzeptiert,
    VerbindungBestaetigt(VerbindungBestaetigt),
    Kick(Kick),
    GainSetzen(GainSetzen),
    KanalListe(Vec<KanalEintrag>),
    ServerRegistrieren(ServerInfo),
    ServerAbmelden,
}

impl Nachricht {
    /// Typ-Byte dieser Nachricht
    pub fn typ(&self) -> NachrichtenTyp {
        match self {
            Self::Audio(_) => NachrichtenTyp::Audio,
            Self::KanalInfo(_) => NachrichtenTyp::KanalInfo,
            Self::Chat(_) => NachrichtenTyp::Chat,
            Self::Ping(_) => NachrichtenTyp::Ping,
            Self::PingAntwort(_) => NachrichtenTyp::PingAntwort,
            Self::Verbinden(_) => NachrichtenTyp::Verbinden,
            Self::Trennen(_) => NachrichtenTyp::Trennen,
            Self::ServerListe(_) => NachrichtenTyp::ServerListe,
            Self::ServerListeAnfordern => NachrichtenTyp::ServerListeAnfordern,
            Self::LizenzErforderlich(_) => NachrichtenTyp::LizenzErforderlich,
            Self::LizenzAkzeptiert => NachrichtenTyp::LizenzAkzeptiert,
            Self::VerbindungBestaetigt(_) => NachrichtenTyp::VerbindungBestaetigt,
            Self::Kick(_) => NachrichtenTyp::Kick,
            Self::GainSetzen(_) => NachrichtenTyp::GainSetzen,
            Self::KanalListe(_) => NachrichtenTyp::KanalListe,
            Self::ServerRegistrieren(_) => NachrichtenTyp::ServerRegistrieren,
            Self::ServerAbmelden => NachrichtenTyp::ServerAbmelden,
        }
    }

    /// Serialisiert die Nachricht als vollstaendiges Datagramm
    pub fn encode(&self) -> Result<Bytes, WireFehler> {
        let mut buf = BytesMut::new();
        self.schreiben(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Haengt das Datagramm an `dst` an
    pub fn schreiben(&self, dst: &mut BytesMut) -> Result<(), WireFehler> {
        let start = dst.len();
        dst.reserve(KOPF_LAENGE + 64 + CRC_LAENGE);
        dst.put_slice(&KENNUNG);
        dst.put_u8(PROTOKOLL_VERSION);
        dst.put_u8(self.typ() as u8);
        // Laenge wird nach dem Schreiben der Payload eingetragen
        dst.put_u16(0);

        match self {
            Self::Audio(paket) => paket.payload_schreiben(dst),
            Self::KanalInfo(info) => json_schreiben(dst, info)?,
            Self::Chat(chat) => json_schreiben(dst, chat)?,
            Self::Ping(ping) | Self::PingAntwort(ping) => json_schreiben(dst, ping)?,
            Self::Verbinden(v) => json_schreiben(dst, v)?,
            Self::Trennen(t) => json_schreiben(dst, t)?,
            Self::ServerListe(liste) => json_schreiben(dst, liste)?,
            Self::LizenzErforderlich(typ) => json_schreiben(dst, typ)?,
            Self::VerbindungBestaetigt(b) => json_schreiben(dst, b)?,
            Self::Kick(k) => json_schreiben(dst, k)?,
            Self::GainSetzen(g) => json_schreiben(dst, g)?,
            Self::KanalListe(liste) => json_schreiben(dst, liste)?,
            Self::ServerRegistrieren(info) => json_schreiben(dst, info)?,
            Self::ServerListeAnfordern | Self::LizenzAkzeptiert | Self::ServerAbmelden => {}
        }

        let payload_laenge = dst.len() - start - KOPF_LAENGE;
        if payload_laenge > MAX_PAYLOAD_LAENGE {
            dst.truncate(start);
            return Err(WireFehler::PayloadZuGross(payload_laenge));
        }
        dst[start + 4..start + 6].copy_from_slice(&(payload_laenge as u16).to_be_bytes());

        let crc = crc32fast::hash(&dst[start..]);
        dst.put_u32(crc);
        Ok(())
    }

    /// Dekodiert und validiert ein vollstaendiges Datagramm
    pub fn decode(datagramm: &[u8]) -> Result<Self, WireFehler> {
        if datagramm.len() < KOPF_LAENGE + CRC_LAENGE {
            return Err(WireFehler::ZuKurz(datagramm.len()));
        }

        let kennung = [datagramm[0], datagramm[1]];
        if kennung != KENNUNG {
            return Err(WireFehler::FalscheKennung(kennung));
        }

        if datagramm[2] != PROTOKOLL_VERSION {
            return Err(WireFehler::Version(datagramm[2]));
        }

        let angegeben = u16::from_be_bytes([datagramm[4], datagramm[5]]) as usize;
        let vorhanden = datagramm.len() - KOPF_LAENGE - CRC_LAENGE;
        if angegeben != vorhanden {
            return Err(WireFehler::LaengeFalsch {
                angegeben,
                vorhanden,
            });
        }

        let ende = KOPF_LAENGE + angegeben;
        let erwartet = u32::from_be_bytes([
            datagramm[ende],
            datagramm[ende + 1],
            datagramm[ende + 2],
            datagramm[ende + 3],
        ]);
        let berechnet = crc32fast::hash(&datagramm[..ende]);
        if erwartet != berechnet {
            return Err(WireFehler::Pruefsumme {
                erwartet,
                berechnet,
            });
        }

        let typ = NachrichtenTyp::from_u8(datagramm[3])
            .ok_or(WireFehler::UnbekannterTyp(datagramm[3]))?;
        let payload = &datagramm[KOPF_LAENGE..ende];

        let nachricht = match typ {
            NachrichtenTyp::Audio => Self::Audio(AudioPaket::payload_lesen(payload)?),
            NachrichtenTyp::KanalInfo => {
                let info: KanalInfo = json_lesen(payload)?;
                info.pruefen().map_err(WireFehler::Ungueltig)?;
                Self::KanalInfo(info)
            }
            NachrichtenTyp::Chat => {
                let chat: ChatNachricht = json_lesen(payload)?;
                chat.pruefen().map_err(WireFehler::Ungueltig)?;
                Self::Chat(chat)
            }
            NachrichtenTyp::Ping => Self::Ping(json_lesen(payload)?),
            NachrichtenTyp::PingAntwort => Self::PingAntwort(json_lesen(payload)?),
            NachrichtenTyp::Verbinden => {
                let v: Verbinden = json_lesen(payload)?;
                v.pruefen().map_err(WireFehler::Ungueltig)?;
                Self::Verbinden(v)
            }
            NachrichtenTyp::Trennen => Self::Trennen(json_lesen(payload)?),
            NachrichtenTyp::ServerListe => {
                let liste: Vec<ServerListenEintrag> = json_lesen(payload)?;
                if liste.len() > MAX_LISTEN_EINTRAEGE {
                    return Err(WireFehler::Ungueltig(format!(
                        "Server-Liste mit {} Eintraegen",
                        liste.len()
                    )));
                }
                Self::ServerListe(liste)
            }
            NachrichtenTyp::ServerListeAnfordern => {
                leer_pruefen(payload)?;
                Self::ServerListeAnfordern
            }
            NachrichtenTyp::LizenzErforderlich => Self::LizenzErforderlich(json_lesen(payload)?),
            NachrichtenTyp::LizenzAkzeptiert => {
                leer_pruefen(payload)?;
                Self::LizenzAkzeptiert
            }
            NachrichtenTyp::VerbindungBestaetigt => {
                Self::VerbindungBestaetigt(json_lesen(payload)?)
            }
            NachrichtenTyp::Kick => Self::Kick(json_lesen(payload)?),
            NachrichtenTyp::GainSetzen => {
                let g: GainSetzen = json_lesen(payload)?;
                g.pruefen().map_err(WireFehler::Ungueltig)?;
                Self::GainSetzen(g)
            }
            NachrichtenTyp::KanalListe => Self::KanalListe(json_lesen(payload)?),
            NachrichtenTyp::ServerRegistrieren => {
                let info: ServerInfo = json_lesen(payload)?;
                info.pruefen().map_err(WireFehler::Ungueltig)?;
                Self::ServerRegistrieren(info)
            }
            NachrichtenTyp::ServerAbmelden => {
                leer_pruefen(payload)?;
                Self::ServerAbmelden
            }
        };

        Ok(nachricht)
    }
}

fn json_schreiben<T: Serialize>(dst: &mut BytesMut, wert: &T) -> Result<(), WireFehler> {
    let json = serde_json::to_vec(wert).map_err(|e| WireFehler::Json(e.to_string()))?;
    dst.put_slice(&json);
    Ok(())
}

fn json_lesen<T: DeserializeOwned>(payload: &[u8]) -> Result<T, WireFehler> {
    serde_json::from_slice(payload).map_err(|e| WireFehler::Json(e.to_string()))
}

fn leer_pruefen(payload: &[u8]) -> Result<(), WireFehler> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(WireFehler::Ungueltig(format!(
            "Unerwartete Payload von {} Bytes",
            payload.len()
        )))
    }
}

// ---------------------------------------------------------------------------
// DatagrammCodec
// ---------------------------------------------------------------------------

/// tokio-util Codec fuer `UdpFramed`
///
/// Jeder Aufruf von `decode` verbraucht den gesamten Puffer, da ein
/// Datagramm immer genau eine Nachricht enthaelt. Ein fehlerhaftes Datagramm
/// hinterlaesst daher keinen Rest, und der Stream liest danach normal weiter.
#[derive(Debug, Clone, Default)]
pub struct DatagrammCodec;

impl DatagrammCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for DatagrammCodec {
    type Item = Nachricht;
    type Error = WireFehler;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagramm = src.split_to(src.len());
        Nachricht::decode(&datagramm).map(Some)
    }
}

impl Encoder<Nachricht> for DatagrammCodec {
    type Error = WireFehler;

    fn encode(&mut self, item: Nachricht, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.schreiben(dst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameFormat;
    use crate::control::TrennGrund;

    fn beispiel_audio() -> Nachricht {
        Nachricht::Audio(AudioPaket::neu(7, vec![0x11; 68]))
    }

    #[test]
    fn audio_datagramm_aufbau() {
        let bytes = beispiel_audio().encode().unwrap();
        assert_eq!(&bytes[..2], b"KR");
        assert_eq!(bytes[2], PROTOKOLL_VERSION);
        assert_eq!(bytes[3], NachrichtenTyp::Audio as u8);
        assert_eq!(u16::from_be_bytes([bytes[4], bytes[5]]), 72);
        assert_eq!(bytes.len(), KOPF_LAENGE + 72 + CRC_LAENGE);
    }

    #[test]
    fn steuer_nachrichten_ueberleben_den_draht() {
        let nachrichten = vec![
            Nachricht::Verbinden(Verbinden {
                client_name: "Gitarre".into(),
                format: FrameFormat::default(),
            }),
            Nachricht::Trennen(Trennen {
                grund: TrennGrund::ClientBeendet,
            }),
            Nachricht::ServerListeAnfordern,
            Nachricht::LizenzErforderlich(LizenzTyp::CreativeCommons),
            Nachricht::LizenzAkzeptiert,
            Nachricht::ServerListe(vec![ServerListenEintrag {
                adresse: "10.0.0.1:22124".parse().unwrap(),
                name: "Uebungsraum".into(),
                stadt: "Wien".into(),
                land: 14,
                kanaele: 10,
            }]),
        ];
        for n in nachrichten {
            let bytes = n.encode().unwrap();
            assert_eq!(Nachricht::decode(&bytes).unwrap(), n);
        }
    }

    #[test]
    fn gekippter_bit_wird_erkannt() {
        let mut bytes = beispiel_audio().encode().unwrap().to_vec();
        bytes[10] ^= 0x01;
        assert!(matches!(
            Nachricht::decode(&bytes),
            Err(WireFehler::Pruefsumme { .. })
        ));
    }

    #[test]
    fn abgeschnittenes_datagramm_abgelehnt() {
        let bytes = beispiel_audio().encode().unwrap();
        let kurz = &bytes[..bytes.len() - 3];
        assert!(matches!(
            Nachricht::decode(kurz),
            Err(WireFehler::LaengeFalsch { .. })
        ));
        assert!(matches!(
            Nachricht::decode(&bytes[..5]),
            Err(WireFehler::ZuKurz(5))
        ));
    }

    #[test]
    fn fremde_kennung_abgelehnt() {
        let mut bytes = beispiel_audio().encode().unwrap().to_vec();
        bytes[0] = b'X';
        assert!(matches!(
            Nachricht::decode(&bytes),
            Err(WireFehler::FalscheKennung(_))
        ));
    }

    /// Baut ein Datagramm mit gueltiger Pruefsumme aus Rohteilen
    fn roh_datagramm(version: u8, typ: u8, payload: &[u8]) -> Vec<u8> {
        let mut d = Vec::new();
        d.extend_from_slice(&KENNUNG);
        d.push(version);
        d.push(typ);
        d.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        d.extend_from_slice(payload);
        let crc = crc32fast::hash(&d);
        d.extend_from_slice(&crc.to_be_bytes());
        d
    }

    #[test]
    fn unbekannter_typ_abgelehnt() {
        let d = roh_datagramm(PROTOKOLL_VERSION, 200, &[]);
        assert!(matches!(
            Nachricht::decode(&d),
            Err(WireFehler::UnbekannterTyp(200))
        ));
    }

    #[test]
    fn falsche_version_abgelehnt() {
        let d = roh_datagramm(9, NachrichtenTyp::Ping as u8, b"{}");
        assert!(matches!(Nachricht::decode(&d), Err(WireFehler::Version(9))));
    }

    #[test]
    fn kaputtes_json_abgelehnt() {
        let d = roh_datagramm(PROTOKOLL_VERSION, NachrichtenTyp::Chat as u8, b"{\"text\":");
        assert!(matches!(Nachricht::decode(&d), Err(WireFehler::Json(_))));
    }

    #[test]
    fn leere_nachricht_mit_payload_abgelehnt() {
        let d = roh_datagramm(
            PROTOKOLL_VERSION,
            NachrichtenTyp::LizenzAkzeptiert as u8,
            &[1],
        );
        assert!(matches!(Nachricht::decode(&d), Err(WireFehler::Ungueltig(_))));
    }

    #[test]
    fn zu_langer_name_abgelehnt() {
        let json = format!(
            r#"{{"client_name":"{}","format":{{"groesse":"samples64","kanaele":"mono","codec":"pcm16"}}}}"#,
            "n".repeat(100)
        );
        let d = roh_datagramm(
            PROTOKOLL_VERSION,
            NachrichtenTyp::Verbinden as u8,
            json.as_bytes(),
        );
        assert!(matches!(Nachricht::decode(&d), Err(WireFehler::Ungueltig(_))));
    }

    #[test]
    fn codec_verbraucht_ganzes_datagramm_auch_bei_fehler() {
        let mut codec = DatagrammCodec::new();
        let mut buf = BytesMut::from(&b"muell"[..]);
        assert!(codec.decode(&mut buf).is_err());
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_encoder_und_decoder() {
        let mut codec = DatagrammCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Nachricht::Ping(Ping { zeitstempel_ms: 99 }), &mut buf)
            .unwrap();
        let n = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(n, Nachricht::Ping(Ping { zeitstempel_ms: 99 }));
    }
}
