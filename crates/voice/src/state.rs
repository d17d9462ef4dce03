//! Verbindungs-Register – In-Memory Zustand aller verbundenen Clients
//!
//! Verwaltet pro Adresse:
//! - Verbindungs-ID und zugewiesenen Slot
//! - Name, Frame-Format und Kanal-Info
//! - Lebenszyklus-Phase (`Verbindend → Aktiv → Getrennt`)
//! - Zeitpunkt des letzten Pakets fuer den Timeout
//!
//! Thread-safe durch DashMap. Die Audio-Daten selbst liegen im Slot-Arena
//! des Mixers, hier steht nur die Buchhaltung.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use klangraum_core::{SitzungsEreignis, SlotId, TrennGrund, VerbindungsId};
use klangraum_protocol::codec::FrameFormat;
use klangraum_protocol::control::{KanalEintrag, KanalInfo};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timeout fuer Verbindungen ohne Verkehr
pub const VERBINDUNGS_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Verbindung
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbindungsPhase {
    /// Handshake akzeptiert, noch kein Audio
    Verbindend,
    /// Mindestens ein Audio-Frame empfangen
    Aktiv,
    Getrennt,
}

/// Zustand einer einzelnen Verbindung
#[derive(Debug, Clone)]
pub struct Verbindung {
    pub id: VerbindungsId,
    pub adresse: SocketAddr,
    pub slot: SlotId,
    pub name: String,
    pub format: FrameFormat,
    pub phase: VerbindungsPhase,
    pub verbunden_um: DateTime<Utc>,
    pub letztes_paket: Instant,
    pub kanal_info: KanalInfo,
}

impl Verbindung {
    fn neu(adresse: SocketAddr, slot: SlotId, name: String, format: FrameFormat) -> Self {
        Self {
            id: VerbindungsId::new(),
            adresse,
            slot,
            kanal_info: KanalInfo {
                name: name.clone(),
                ..KanalInfo::default()
            },
            name,
            format,
            phase: VerbindungsPhase::Verbindend,
            verbunden_um: Utc::now(),
            letztes_paket: Instant::now(),
        }
    }

    /// Prueft ob die Verbindung als inaktiv gilt (kein Paket seit `timeout`)
    pub fn ist_inaktiv(&self, timeout: Duration) -> bool {
        self.letztes_paket.elapsed() > timeout
    }

    /// Verbindungsdauer in Sekunden bis `jetzt`
    pub fn dauer_s(&self, jetzt: DateTime<Utc>) -> u64 {
        (jetzt - self.verbunden_um).num_seconds().max(0) as u64
    }

    pub fn verbunden_ereignis(&self) -> SitzungsEreignis {
        SitzungsEreignis::Verbunden {
            id: self.id,
            adresse: self.adresse,
            name: self.name.clone(),
            slot: self.slot,
        }
    }

    fn getrennt_ereignis(&self, war_aktiv: bool, grund: TrennGrund) -> SitzungsEreignis {
        SitzungsEreignis::Getrennt {
            id: self.id,
            adresse: self.adresse,
            name: self.name.clone(),
            verbunden_um: self.verbunden_um,
            dauer_s: self.dauer_s(Utc::now()),
            war_aktiv,
            grund,
        }
    }
}

/// Ergebnis eines Handshakes
#[derive(Debug, Clone)]
pub struct VerbindenErgebnis {
    pub verbindung: Verbindung,
    /// `true` wenn die Adresse bereits verbunden war (Eintrag zurueckgesetzt)
    pub erneuert: bool,
}

/// Ergebnis einer Trennung
#[derive(Debug, Clone)]
pub struct Trennung {
    pub verbindung: Verbindung,
    pub ereignis: SitzungsEreignis,
}

// ---------------------------------------------------------------------------
// VerbindungsRegister
// ---------------------------------------------------------------------------

/// Zentrales Register aller Verbindungen, indexiert nach Adresse
///
/// Clones teilen denselben Zustand.
#[derive(Clone, Default)]
pub struct VerbindungsRegister {
    inner: Arc<DashMap<SocketAddr, Verbindung>>,
}

impl VerbindungsRegister {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Registriert einen Handshake
    ///
    /// Ist die Adresse bereits bekannt, wird der Eintrag zurueckgesetzt statt
    /// verdoppelt: Slot, ID und Verbindungszeit bleiben, Name und Format
    /// werden uebernommen.
    ///
    /// Die Sitzung laeuft dabei weiter. Auch die Phase bleibt, ein bereits
    /// aktiver Client erzeugt also keinen Historien-Eintrag beim erneuten
    /// Handshake, sondern genau einen beim endgueltigen Trennen, mit Name und
    /// Dauer ab dem ersten Handshake.
    pub fn verbinden(
        &self,
        adresse: SocketAddr,
        slot: SlotId,
        name: String,
        format: FrameFormat,
    ) -> VerbindenErgebnis {
        if let Some(mut eintrag) = self.inner.get_mut(&adresse) {
            eintrag.name = name.clone();
            eintrag.kanal_info.name = name;
            eintrag.format = format;
            eintrag.letztes_paket = Instant::now();
            tracing::debug!(adresse = %adresse, slot = %eintrag.slot, "Handshake wiederholt, Verbindung zurueckgesetzt");
            return VerbindenErgebnis {
                verbindung: eintrag.clone(),
                erneuert: true,
            };
        }

        let verbindung = Verbindung::neu(adresse, slot, name, format);
        self.inner.insert(adresse, verbindung.clone());
        tracing::info!(
            adresse = %adresse,
            slot = %slot,
            name = %verbindung.name,
            "Client verbunden"
        );
        VerbindenErgebnis {
            verbindung,
            erneuert: false,
        }
    }

    /// Erstes Audio-Frame: `Verbindend → Aktiv`
    pub fn aktivieren(&self, adresse: &SocketAddr) -> Option<SitzungsEreignis> {
        let mut eintrag = self.inner.get_mut(adresse)?;
        if eintrag.phase != VerbindungsPhase::Verbindend {
            return None;
        }
        eintrag.phase = VerbindungsPhase::Aktiv;
        tracing::debug!(adresse = %adresse, slot = %eintrag.slot, "Verbindung aktiv");
        Some(SitzungsEreignis::Aktiviert {
            id: eintrag.id,
            slot: eintrag.slot,
        })
    }

    /// Aktualisiert den Paket-Zeitstempel; `false` fuer unbekannte Adressen
    pub fn paket_empfangen(&self, adresse: &SocketAddr) -> bool {
        match self.inner.get_mut(adresse) {
            Some(mut eintrag) => {
                eintrag.letztes_paket = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Entfernt eine Verbindung; wiederholtes Trennen ist wirkungslos
    pub fn trennen(&self, adresse: &SocketAddr, grund: TrennGrund) -> Option<Trennung> {
        let (_, mut verbindung) = self.inner.remove(adresse)?;
        let war_aktiv = verbindung.phase == VerbindungsPhase::Aktiv;
        verbindung.phase = VerbindungsPhase::Getrennt;
        let ereignis = verbindung.getrennt_ereignis(war_aktiv, grund);
        tracing::info!(
            adresse = %adresse,
            slot = %verbindung.slot,
            name = %verbindung.name,
            grund = %grund,
            "Client getrennt"
        );
        Some(Trennung {
            verbindung,
            ereignis,
        })
    }

    /// Trennt alle Verbindungen ohne Verkehr seit `timeout`
    pub fn inaktive_entfernen(&self, timeout: Duration) -> Vec<Trennung> {
        let inaktive: Vec<SocketAddr> = self
            .inner
            .iter()
            .filter(|e| e.ist_inaktiv(timeout))
            .map(|e| e.adresse)
            .collect();

        inaktive
            .iter()
            .filter_map(|adresse| self.trennen(adresse, TrennGrund::Zeitueberschreitung))
            .collect()
    }

    pub fn kanal_info_setzen(&self, adresse: &SocketAddr, info: KanalInfo) -> bool {
        match self.inner.get_mut(adresse) {
            Some(mut eintrag) => {
                eintrag.kanal_info = info;
                true
            }
            None => false,
        }
    }

    pub fn verbindung(&self, adresse: &SocketAddr) -> Option<Verbindung> {
        self.inner.get(adresse).map(|e| e.clone())
    }

    pub fn slot_von(&self, adresse: &SocketAddr) -> Option<SlotId> {
        self.inner.get(adresse).map(|e| e.slot)
    }

    pub fn adresse_von_slot(&self, slot: SlotId) -> Option<SocketAddr> {
        self.inner.iter().find(|e| e.slot == slot).map(|e| e.adresse)
    }

    /// Alle Verbindungen, nach Slot sortiert
    pub fn schnappschuss(&self) -> Vec<Verbindung> {
        let mut alle: Vec<Verbindung> = self.inner.iter().map(|e| e.clone()).collect();
        alle.sort_by_key(|v| v.slot);
        alle
    }

    /// Teilnehmerliste fuer `KanalListe`
    pub fn kanal_liste(&self) -> Vec<KanalEintrag> {
        self.schnappschuss()
            .into_iter()
            .map(|v| KanalEintrag {
                slot: v.slot.0,
                info: v.kanal_info,
            })
            .collect()
    }

    pub fn adressen(&self) -> Vec<SocketAddr> {
        self.inner.iter().map(|e| e.adresse).collect()
    }

    pub fn anzahl(&self) -> usize {
        self.inner.len()
    }

    pub fn ist_verbunden(&self, adresse: &SocketAddr) -> bool {
        self.inner.contains_key(adresse)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use klangraum_protocol::codec::{CodecTyp, FrameGroesse, KanalAnzahl};
    use std::net::{IpAddr, Ipv4Addr};

    fn adresse(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn format(groesse: FrameGroesse) -> FrameFormat {
        FrameFormat::neu(groesse, KanalAnzahl::Mono, CodecTyp::ImaAdpcm)
    }

    #[test]
    fn verbinden_und_abfragen() {
        let reg = VerbindungsRegister::neu();
        let e = reg.verbinden(adresse(10000), SlotId(0), "Gitarre".into(), format(FrameGroesse::Samples128));
        assert!(!e.erneuert);
        assert_eq!(reg.anzahl(), 1);
        assert_eq!(reg.slot_von(&adresse(10000)), Some(SlotId(0)));
        assert_eq!(reg.adresse_von_slot(SlotId(0)), Some(adresse(10000)));
        assert_eq!(e.verbindung.kanal_info.name, "Gitarre");
    }

    #[test]
    fn erneuter_handshake_setzt_zurueck_statt_zu_verdoppeln() {
        let reg = VerbindungsRegister::neu();
        let erste = reg.verbinden(adresse(10001), SlotId(3), "A".into(), format(FrameGroesse::Samples128));
        reg.aktivieren(&adresse(10001));

        let zweite = reg.verbinden(adresse(10001), SlotId(7), "B".into(), format(FrameGroesse::Samples64));
        assert!(zweite.erneuert);
        assert_eq!(reg.anzahl(), 1);
        assert_eq!(zweite.verbindung.id, erste.verbindung.id);
        assert_eq!(zweite.verbindung.slot, SlotId(3), "Slot bleibt erhalten");
        assert_eq!(zweite.verbindung.name, "B");
        assert_eq!(zweite.verbindung.format.groesse, FrameGroesse::Samples64);
    }

    #[test]
    fn erneuter_handshake_haelt_die_sitzung() {
        let reg = VerbindungsRegister::neu();
        let erste = reg.verbinden(adresse(10005), SlotId(2), "Alt".into(), format(FrameGroesse::Samples128));
        assert!(reg.aktivieren(&adresse(10005)).is_some());

        let zweite = reg.verbinden(adresse(10005), SlotId(2), "Neu".into(), format(FrameGroesse::Samples128));
        assert_eq!(zweite.verbindung.phase, VerbindungsPhase::Aktiv);
        assert_eq!(zweite.verbindung.verbunden_um, erste.verbindung.verbunden_um);
        // Kein zweites Aktivieren, also kein zweiter Sitzungsbeginn
        assert!(reg.aktivieren(&adresse(10005)).is_none());

        let t = reg.trennen(&adresse(10005), TrennGrund::ClientBeendet).unwrap();
        match t.ereignis {
            SitzungsEreignis::Getrennt { id, war_aktiv, name, .. } => {
                assert_eq!(id, erste.verbindung.id);
                assert!(war_aktiv);
                assert_eq!(name, "Neu");
            }
            andere => panic!("Unerwartetes Ereignis: {andere:?}"),
        }
    }

    #[test]
    fn aktivieren_nur_einmal() {
        let reg = VerbindungsRegister::neu();
        reg.verbinden(adresse(10002), SlotId(0), "X".into(), format(FrameGroesse::Samples128));
        assert!(matches!(
            reg.aktivieren(&adresse(10002)),
            Some(SitzungsEreignis::Aktiviert { slot: SlotId(0), .. })
        ));
        assert!(reg.aktivieren(&adresse(10002)).is_none());
        assert!(reg.aktivieren(&adresse(9)).is_none());
    }

    #[test]
    fn trennen_meldet_dauer_und_phase() {
        let reg = VerbindungsRegister::neu();
        reg.verbinden(adresse(10003), SlotId(1), "Y".into(), format(FrameGroesse::Samples128));
        reg.aktivieren(&adresse(10003));

        let t = reg.trennen(&adresse(10003), TrennGrund::ClientBeendet).unwrap();
        assert_eq!(t.verbindung.phase, VerbindungsPhase::Getrennt);
        match t.ereignis {
            SitzungsEreignis::Getrennt { war_aktiv, grund, name, .. } => {
                assert!(war_aktiv);
                assert_eq!(grund, TrennGrund::ClientBeendet);
                assert_eq!(name, "Y");
            }
            andere => panic!("Unerwartetes Ereignis: {andere:?}"),
        }
        assert!(reg.trennen(&adresse(10003), TrennGrund::ClientBeendet).is_none());
        assert_eq!(reg.anzahl(), 0);
    }

    #[test]
    fn inaktive_werden_entfernt() {
        let reg = VerbindungsRegister::neu();
        reg.verbinden(adresse(10004), SlotId(0), "alt".into(), format(FrameGroesse::Samples128));
        reg.verbinden(adresse(10005), SlotId(1), "neu".into(), format(FrameGroesse::Samples128));
        std::thread::sleep(Duration::from_millis(20));
        reg.paket_empfangen(&adresse(10005));

        let entfernt = reg.inaktive_entfernen(Duration::from_millis(10));
        assert_eq!(entfernt.len(), 1);
        assert_eq!(entfernt[0].verbindung.adresse, adresse(10004));
        assert!(matches!(
            entfernt[0].ereignis,
            SitzungsEreignis::Getrennt {
                grund: TrennGrund::Zeitueberschreitung,
                war_aktiv: false,
                ..
            }
        ));
        assert!(reg.ist_verbunden(&adresse(10005)));
    }

    #[test]
    fn kanal_liste_nach_slot_sortiert() {
        let reg = VerbindungsRegister::neu();
        reg.verbinden(adresse(10006), SlotId(2), "zwei".into(), format(FrameGroesse::Samples128));
        reg.verbinden(adresse(10007), SlotId(0), "null".into(), format(FrameGroesse::Samples128));
        reg.kanal_info_setzen(
            &adresse(10006),
            KanalInfo {
                name: "Zwei".into(),
                stadt: "Wien".into(),
                land: 40,
                instrument: Some("Bass".into()),
            },
        );
        let liste = reg.kanal_liste();
        assert_eq!(liste.iter().map(|e| e.slot).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(liste[1].info.stadt, "Wien");
    }

    #[test]
    fn clone_teilt_inneren_state() {
        let reg1 = VerbindungsRegister::neu();
        let reg2 = reg1.clone();
        reg1.verbinden(adresse(10008), SlotId(0), "z".into(), format(FrameGroesse::Samples128));
        assert!(reg2.ist_verbunden(&adresse(10008)));
    }
}
