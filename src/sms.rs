//! SMS store & codec glue (C9): per-storage sparse part indices, PDU
//! decode/encode via [`crate::pdu`], and multi-part concatenation assembly
//! (spec.md §4.9).

use std::time::Duration;

use log::{info, warn};

use crate::at::AtCommand;
use crate::error::Error;
use crate::hex;
use crate::modem::{Backend, Modem};
use crate::pdu::{self, Concatenation, DeliverFields};
use crate::qmi::tlv::{self, Tlv};
use crate::qmi::Service;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Sim,
    Me,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Received,
    StoredSent,
    StoredUnsent,
    Sent,
}

#[derive(Debug, Clone)]
pub struct Part {
    pub storage: Storage,
    pub index: u32,
    pub state: PartState,
    pub fields: DeliverFields,
}

/// A logical SMS assembled from one or more parts sharing a concatenation
/// reference, ordered by sequence.
#[derive(Debug, Clone)]
pub struct Message {
    pub sender: String,
    pub timestamp: String,
    pub text: String,
    pub parts: Vec<u32>,
}

#[derive(Default)]
struct PendingConcat {
    reference: u16,
    total_parts: u8,
    pieces: Vec<Option<(u32, String)>>,
}

pub struct SmsStore {
    parts: Vec<Part>,
    pending: Vec<PendingConcat>,
}

impl SmsStore {
    pub fn new() -> Self {
        Self { parts: Vec::new(), pending: Vec::new() }
    }

    pub fn list(&self, storage: Storage) -> Vec<&Part> {
        self.parts.iter().filter(|p| p.storage == storage).collect()
    }

    /// Insert a freshly decoded part, keeping the (storage, index) uniqueness
    /// invariant (spec.md §5 invariant 3) by replacing any existing entry at
    /// the same slot.
    fn insert(&mut self, part: Part) {
        if let Some(existing) = self.parts.iter_mut().find(|p| p.storage == part.storage && p.index == part.index) {
            *existing = part;
        } else {
            self.parts.push(part);
        }
    }

    pub fn remove(&mut self, storage: Storage, index: u32) -> bool {
        let before = self.parts.len();
        self.parts.retain(|p| !(p.storage == storage && p.index == index));
        self.parts.len() != before
    }

    /// Fold a newly-stored part into any in-progress concatenation and
    /// return the assembled message once every piece has arrived.
    fn try_assemble(&mut self, index: u32, concat: &Concatenation, text: &str) -> Option<(Concatenation, String)> {
        let group = match self
            .pending
            .iter_mut()
            .find(|g| g.reference == concat.reference && g.total_parts == concat.total_parts)
        {
            Some(g) => g,
            None => {
                self.pending.push(PendingConcat {
                    reference: concat.reference,
                    total_parts: concat.total_parts,
                    pieces: vec![None; concat.total_parts as usize],
                });
                self.pending.last_mut().unwrap()
            }
        };

        let slot = (concat.sequence.saturating_sub(1)) as usize;
        if slot < group.pieces.len() {
            group.pieces[slot] = Some((index, text.to_string()));
        }

        if group.pieces.iter().all(|p| p.is_some()) {
            let assembled: String =
                group.pieces.iter().map(|p| p.as_ref().unwrap().1.as_str()).collect();
            let reference = group.reference;
            let total_parts = group.total_parts;
            self.pending.retain(|g| !(g.reference == reference && g.total_parts == total_parts));
            Some((concat.clone(), assembled))
        } else {
            None
        }
    }
}

impl Default for SmsStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn backend_of(modem: &Modem) -> Result<Backend, Error> {
    let state = modem.state.read().await;
    match &state.backend {
        Some(Backend::At(at)) => Ok(Backend::At(at.clone())),
        Some(Backend::Qmi(qmi)) => Ok(Backend::Qmi(qmi.clone())),
        None => Err(Error::WrongState("transport not open".into())),
    }
}

fn storage_name(storage: Storage) -> &'static str {
    match storage {
        Storage::Sim => "SM",
        Storage::Me => "ME",
    }
}

/// List every part index present in `storage`, read each raw PDU, and decode
/// it through [`crate::pdu::decode_deliver`]. Invoked once per storage on
/// enable (spec.md §4.9).
pub async fn list_storage(modem: &Modem, storage: Storage) -> Result<Vec<Part>, Error> {
    let backend = backend_of(modem).await?;
    let mut parts = Vec::new();
    match backend {
        Backend::At(at) => {
            at.command(&AtCommand::new(format!("AT+CPMS=\"{}\"", storage_name(storage)), Duration::from_secs(5)))
                .await?;
            let resp = at.command(&AtCommand::new("AT+CMGL=4", Duration::from_secs(10))).await?;
            for index in parse_cmgl_indices(&resp.join("\n")) {
                if let Some(part) = read_at_part(&at, storage, index).await? {
                    parts.push(part);
                }
            }
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(Service::Wms).await?;
            let storage_byte = if storage == Storage::Sim { 0x00 } else { 0x01 };
            let input = [Tlv::u8(0x01, storage_byte)];
            let output = qmi.invoke(client, 0x0031, &input, Duration::from_secs(10)).await?;
            for index in parse_qmi_list(&output) {
                if let Some(part) = read_qmi_part(&qmi, storage, index).await? {
                    parts.push(part);
                }
            }
        }
    }
    Ok(parts)
}

async fn read_at_part<IO>(
    at: &std::sync::Arc<crate::transport::AtSession<IO>>,
    storage: Storage,
    index: u32,
) -> Result<Option<Part>, Error>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    let resp = at.command(&AtCommand::new(format!("AT+CMGR={index}"), Duration::from_secs(5))).await?;
    let pdu_line = resp.iter().rev().find(|l| !l.trim().is_empty() && l.chars().all(|c| c.is_ascii_hexdigit()));
    let Some(pdu_line) = pdu_line else { return Ok(None) };
    let bytes = hex::decode(pdu_line).map_err(|e| Error::InvalidArgument(e.to_string()))?;
    let fields = pdu::decode_deliver(&bytes)?;
    Ok(Some(Part { storage, index, state: PartState::Received, fields }))
}

async fn read_qmi_part<IO>(
    qmi: &std::sync::Arc<crate::transport::QmiSession<IO>>,
    storage: Storage,
    index: u32,
) -> Result<Option<Part>, Error>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    let client = qmi.allocate_client(Service::Wms).await?;
    let storage_byte = if storage == Storage::Sim { 0x00 } else { 0x01 };
    let input = [Tlv::u32_le(0x01, index), Tlv::u8(0x02, storage_byte)];
    let output = qmi.invoke(client, 0x0022, &input, Duration::from_secs(5)).await?;
    let Some(raw) = tlv::find(&output, 0x01) else { return Ok(None) };
    // TLV carries [tag: u8][length: u16 LE][raw PDU bytes]; skip the 3-byte
    // sub-header the public raw-message TLV prepends.
    if raw.value.len() < 3 {
        return Ok(None);
    }
    let fields = pdu::decode_deliver(&raw.value[3..])?;
    Ok(Some(Part { storage, index, state: PartState::Received, fields }))
}

fn parse_cmgl_indices(response: &str) -> Vec<u32> {
    response
        .lines()
        .filter_map(|line| line.strip_prefix("+CMGL:"))
        .filter_map(|rest| rest.trim().split(',').next())
        .filter_map(|n| n.trim().parse().ok())
        .collect()
}

fn parse_qmi_list(tlvs: &[Tlv]) -> Vec<u32> {
    let Some(tlv) = tlv::find(tlvs, 0x01) else { return Vec::new() };
    tlv.value.chunks(4).filter(|c| c.len() == 4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

/// Store a decoded part and, if it completes a concatenation group, return
/// the assembled logical message.
pub fn ingest(store: &mut SmsStore, part: Part) -> Option<Message> {
    let index = part.index;
    let concat = part.fields.concatenation.clone();
    let text = part.fields.text.clone();
    let sender = part.fields.sender.clone();
    let timestamp = part.fields.timestamp.clone();
    store.insert(part);

    match concat {
        Some(concat) => {
            let (concat, assembled) = store.try_assemble(index, &concat, &text)?;
            let part_indices: Vec<u32> = (1..=concat.total_parts as u32).collect();
            Some(Message { sender, timestamp, text: assembled, parts: part_indices })
        }
        None => Some(Message { sender, timestamp, text, parts: vec![index] }),
    }
}

/// Send an SMS, encoding through [`crate::pdu::encode_submit`].
pub async fn send(
    modem: &Modem,
    destination: &str,
    text: &str,
    smsc: Option<&str>,
    class: Option<u8>,
) -> Result<(), Error> {
    let (bytes, offset) = pdu::encode_submit(destination, text, smsc, 0xAA, class)?;
    let backend = backend_of(modem).await?;
    match backend {
        Backend::At(at) => {
            let tpdu_octets = bytes.len() - offset;
            at.command(&AtCommand::new(format!("AT+CMGS={tpdu_octets}"), Duration::from_secs(10))).await?;
            at.command(&AtCommand::new(format!("{}\x1a", hex::encode(&bytes)), Duration::from_secs(10))).await?;
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(Service::Wms).await?;
            let input = [Tlv::u8(0x01, 0x00), Tlv::new(0x02, bytes)];
            qmi.invoke(client, 0x0020, &input, Duration::from_secs(10)).await?;
        }
    }
    info!("modem {} sent sms to {destination}", modem.id);
    Ok(())
}

/// Delete the part at `index` in `storage`.
pub async fn delete(modem: &Modem, storage: Storage, index: u32) -> Result<(), Error> {
    let backend = backend_of(modem).await?;
    match backend {
        Backend::At(at) => {
            at.command(&AtCommand::new(format!("AT+CMGD={index}"), Duration::from_secs(5))).await?;
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(Service::Wms).await?;
            let storage_byte = if storage == Storage::Sim { 0x00 } else { 0x01 };
            let input = [Tlv::u32_le(0x01, index), Tlv::u8(0x02, storage_byte)];
            qmi.invoke(client, 0x0024, &input, Duration::from_secs(5)).await?;
        }
    }
    Ok(())
}

/// Store an already-encoded PDU without sending it (spec.md §4.9 `store`).
pub async fn store(modem: &Modem, pdu_bytes: &[u8]) -> Result<u32, Error> {
    let backend = backend_of(modem).await?;
    match backend {
        Backend::At(at) => {
            at.command(&AtCommand::new(format!("AT+CMGW={}", pdu_bytes.len()), Duration::from_secs(5))).await?;
            let resp = at
                .command(&AtCommand::new(format!("{}\x1a", hex::encode(pdu_bytes)), Duration::from_secs(5)))
                .await?;
            resp.iter()
                .find_map(|l| l.strip_prefix("+CMGW:"))
                .and_then(|n| n.trim().parse().ok())
                .ok_or_else(|| Error::SimFailure("modem did not report a stored index".into()))
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(Service::Wms).await?;
            let input = [Tlv::u8(0x01, 0x00), Tlv::new(0x02, pdu_bytes.to_vec())];
            let output = qmi.invoke(client, 0x0021, &input, Duration::from_secs(5)).await?;
            tlv::find(&output, 0x10)
                .and_then(|t| t.value.get(0..4))
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or_else(|| Error::SimFailure("modem did not report a stored index".into()))
        }
    }
}

/// Program default class-0/class-1 storage routing via QMI WMS `set-routes`,
/// run once on enable (spec.md §4.9). A no-op on the AT backend, which has
/// no equivalent concept.
pub async fn program_default_routes(modem: &Modem, storage: Storage) -> Result<(), Error> {
    let backend = backend_of(modem).await?;
    let Backend::Qmi(qmi) = backend else {
        return Ok(());
    };
    let client = qmi.allocate_client(Service::Wms).await?;
    let storage_byte = if storage == Storage::Sim { 0x00 } else { 0x01 };
    // Route entry: [message-type: class-0][message-class][storage][action:
    // store-and-notify]. Programmed for class 0 and class 1 in one list TLV.
    let mut route_list = vec![0x02u8];
    for message_class in [0x00u8, 0x01u8] {
        route_list.push(0x01); // message type: point-to-point
        route_list.push(message_class);
        route_list.push(storage_byte);
        route_list.push(0x01); // action: store and notify
    }
    let input = [Tlv::new(0x01, route_list)];
    qmi.invoke(client, 0x0035, &input, Duration::from_secs(5)).await.map(|_| ())
}

/// Handle a new-message indication: read the indicated index and ingest it.
pub async fn handle_new_message_indication(
    modem: &Modem,
    store: &mut SmsStore,
    storage: Storage,
    index: u32,
) -> Result<Option<Message>, Error> {
    let backend = backend_of(modem).await?;
    let part = match backend {
        Backend::At(at) => read_at_part(&at, storage, index).await?,
        Backend::Qmi(qmi) => read_qmi_part(&qmi, storage, index).await?,
    };
    match part {
        Some(part) => Ok(ingest(store, part)),
        None => {
            warn!("modem {} new-message indication for missing index {index}", modem.id);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::dcs;

    fn deliver(sender: &str, text: &str, concat: Option<Concatenation>) -> DeliverFields {
        DeliverFields {
            smsc: None,
            sender: sender.into(),
            timestamp: "240102030405+00".into(),
            text: text.into(),
            data_coding_scheme: dcs::encode(dcs::Alphabet::Gsm7, 0),
            concatenation: concat,
        }
    }

    #[test]
    fn single_part_ingest_yields_message_immediately() {
        let mut store = SmsStore::new();
        let part = Part { storage: Storage::Sim, index: 1, state: PartState::Received, fields: deliver("+1", "hi", None) };
        let msg = ingest(&mut store, part).unwrap();
        assert_eq!(msg.text, "hi");
        assert_eq!(msg.parts, vec![1]);
    }

    #[test]
    fn multipart_assembles_only_once_all_present() {
        let mut store = SmsStore::new();
        let concat = Concatenation { reference: 7, total_parts: 2, sequence: 1 };
        let part1 = Part { storage: Storage::Sim, index: 1, state: PartState::Received, fields: deliver("+1", "Hello ", Some(concat.clone())) };
        assert!(ingest(&mut store, part1).is_none());

        let concat2 = Concatenation { reference: 7, total_parts: 2, sequence: 2 };
        let part2 = Part { storage: Storage::Sim, index: 2, state: PartState::Received, fields: deliver("+1", "world", Some(concat2)) };
        let msg = ingest(&mut store, part2).unwrap();
        assert_eq!(msg.text, "Hello world");
        assert_eq!(msg.parts, vec![1, 2]);
    }

    #[test]
    fn multipart_out_of_order_arrival_still_assembles_in_sequence() {
        let mut store = SmsStore::new();
        let concat2 = Concatenation { reference: 3, total_parts: 2, sequence: 2 };
        let part2 = Part { storage: Storage::Sim, index: 9, state: PartState::Received, fields: deliver("+1", "world", Some(concat2)) };
        assert!(ingest(&mut store, part2).is_none());

        let concat1 = Concatenation { reference: 3, total_parts: 2, sequence: 1 };
        let part1 = Part { storage: Storage::Sim, index: 8, state: PartState::Received, fields: deliver("+1", "Hello ", Some(concat1)) };
        let msg = ingest(&mut store, part1).unwrap();
        assert_eq!(msg.text, "Hello world");
    }

    #[test]
    fn remove_drops_only_matching_storage_and_index() {
        let mut store = SmsStore::new();
        store.insert(Part { storage: Storage::Sim, index: 1, state: PartState::Received, fields: deliver("+1", "a", None) });
        store.insert(Part { storage: Storage::Me, index: 1, state: PartState::Received, fields: deliver("+1", "b", None) });
        assert!(store.remove(Storage::Sim, 1));
        assert_eq!(store.list(Storage::Sim).len(), 0);
        assert_eq!(store.list(Storage::Me).len(), 1);
    }

    #[test]
    fn cmgl_indices_parse_from_response_lines() {
        let resp = "+CMGL: 1,1,,23\nSOMEPDU\n+CMGL: 4,1,,30\nOTHERPDU";
        assert_eq!(parse_cmgl_indices(resp), vec![1, 4]);
    }
}
