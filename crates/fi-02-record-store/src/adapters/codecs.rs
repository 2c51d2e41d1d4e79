//! Record bodies for the filter and unspent-output logs.
//!
//! ```text
//! filter: entry_count (i32) | bit_length (i32) | data
//! utxo:   txid (32 bytes) | vout (u32) | script_len (i32) | script
//! journal: kind (u8) | fields
//! ```
//!
//! All integers little endian. A filter tombstone has `entry_count = -1`
//! and zeroed data, so it stays distinct from an empty filter.

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, ScriptBuf, Txid};
use fi_01_golomb_filters::GolombRiceFilter;

use crate::adapters::index::Key;
use crate::domain::{JournalEntry, SpentEntry, StoredFilter, UtxoRecord};
use crate::error::StorageError;
use crate::ports::RecordCodec;

const TOMBSTONE_COUNT: i32 = -1;

/// Filter bodies for a fixed Golomb-Rice parameter.
#[derive(Debug, Clone, Copy)]
pub struct FilterCodec {
    p: u8,
}

impl FilterCodec {
    pub fn new(p: u8) -> Self {
        Self { p }
    }

    pub fn p(&self) -> u8 {
        self.p
    }
}

impl RecordCodec for FilterCodec {
    type Record = StoredFilter;

    fn validate(&self, record: &StoredFilter) -> Result<(), StorageError> {
        let bit_len = match record {
            StoredFilter::Filter(filter) => {
                if filter.p() != self.p {
                    return Err(StorageError::invalid(format!(
                        "filter built with P={}, store uses P={}",
                        filter.p(),
                        self.p
                    )));
                }
                if i32::try_from(filter.n()).is_err() {
                    return Err(StorageError::invalid("filter entry count exceeds i32"));
                }
                filter.bit_len()
            }
            StoredFilter::Tombstone { bit_len } => *bit_len,
        };
        if i32::try_from(bit_len).is_err() {
            return Err(StorageError::invalid("filter bit length exceeds i32"));
        }
        Ok(())
    }

    fn encode(&self, record: &StoredFilter, out: &mut Vec<u8>) {
        match record {
            StoredFilter::Filter(filter) => {
                out.extend_from_slice(&(filter.n() as i32).to_le_bytes());
                out.extend_from_slice(&(filter.bit_len() as i32).to_le_bytes());
                out.extend_from_slice(filter.data());
            }
            StoredFilter::Tombstone { bit_len } => {
                out.extend_from_slice(&TOMBSTONE_COUNT.to_le_bytes());
                out.extend_from_slice(&(*bit_len as i32).to_le_bytes());
                out.resize(out.len() + data_len(*bit_len), 0);
            }
        }
    }

    fn decode(&self, body: &[u8]) -> Result<StoredFilter, StorageError> {
        if body.len() < 8 {
            return Err(StorageError::Malformed("filter body shorter than 8 bytes".into()));
        }
        let entry_count = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let bit_len = i32::from_le_bytes([body[4], body[5], body[6], body[7]]);
        let data = &body[8..];

        let bit_len = u32::try_from(bit_len)
            .map_err(|_| StorageError::Malformed(format!("negative bit length {bit_len}")))?;
        if data.len() != data_len(bit_len) {
            return Err(StorageError::Malformed(format!(
                "{bit_len} bits stored in {} bytes",
                data.len()
            )));
        }

        match entry_count {
            TOMBSTONE_COUNT => Ok(StoredFilter::Tombstone { bit_len }),
            n if n < 0 => Err(StorageError::Malformed(format!("entry count {n}"))),
            n => GolombRiceFilter::from_parts(n as u32, self.p, bit_len, data.to_vec())
                .map(StoredFilter::Filter)
                .map_err(|e| StorageError::Malformed(e.to_string())),
        }
    }
}

fn data_len(bit_len: u32) -> usize {
    (bit_len as usize).div_ceil(8)
}

/// Unspent-output bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct UtxoCodec;

impl RecordCodec for UtxoCodec {
    type Record = UtxoRecord;

    fn validate(&self, record: &UtxoRecord) -> Result<(), StorageError> {
        if i32::try_from(record.script.len()).is_err() {
            return Err(StorageError::invalid("script longer than i32::MAX"));
        }
        Ok(())
    }

    fn encode(&self, record: &UtxoRecord, out: &mut Vec<u8>) {
        out.extend_from_slice(record.outpoint.txid.as_byte_array());
        out.extend_from_slice(&record.outpoint.vout.to_le_bytes());
        out.extend_from_slice(&(record.script.len() as i32).to_le_bytes());
        out.extend_from_slice(record.script.as_bytes());
    }

    fn decode(&self, body: &[u8]) -> Result<UtxoRecord, StorageError> {
        if body.len() < 40 {
            return Err(StorageError::Malformed("utxo body shorter than 40 bytes".into()));
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&body[..32]);
        let vout = u32::from_le_bytes([body[32], body[33], body[34], body[35]]);
        let script_len = i32::from_le_bytes([body[36], body[37], body[38], body[39]]);
        let script = &body[40..];

        if usize::try_from(script_len).ok() != Some(script.len()) {
            return Err(StorageError::Malformed(format!(
                "script length {script_len} with {} bytes left",
                script.len()
            )));
        }

        Ok(UtxoRecord {
            outpoint: OutPoint {
                txid: Txid::from_byte_array(txid),
                vout,
            },
            script: ScriptBuf::from_bytes(script.to_vec()),
        })
    }
}

/// Checkpoint journal bodies.
///
/// ```text
/// 0 start:       data_len (u64) | entry_count (u64)
/// 1 spent:       offset (u64) | utxo body
/// 2 sealed:      data_len (u64) | entry_count (u64) | tag
/// 3 repeat:      tag
/// 4 reverted
/// 5 rolled back
/// ```
///
/// A tag is a `0` byte, or `1` followed by 32 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JournalCodec;

const JOURNAL_START: u8 = 0;
const JOURNAL_SPENT: u8 = 1;
const JOURNAL_SEALED: u8 = 2;
const JOURNAL_REPEAT: u8 = 3;
const JOURNAL_REVERTED: u8 = 4;
const JOURNAL_ROLLED_BACK: u8 = 5;

impl RecordCodec for JournalCodec {
    type Record = JournalEntry;

    fn validate(&self, entry: &JournalEntry) -> Result<(), StorageError> {
        match entry {
            JournalEntry::Spent(spent) => UtxoCodec.validate(&spent.record),
            _ => Ok(()),
        }
    }

    fn encode(&self, entry: &JournalEntry, out: &mut Vec<u8>) {
        match entry {
            JournalEntry::Start {
                data_len,
                entry_count,
            } => {
                out.push(JOURNAL_START);
                out.extend_from_slice(&data_len.to_le_bytes());
                out.extend_from_slice(&entry_count.to_le_bytes());
            }
            JournalEntry::Spent(spent) => {
                out.push(JOURNAL_SPENT);
                out.extend_from_slice(&spent.offset.to_le_bytes());
                UtxoCodec.encode(&spent.record, out);
            }
            JournalEntry::Sealed {
                data_len,
                entry_count,
                tag,
            } => {
                out.push(JOURNAL_SEALED);
                out.extend_from_slice(&data_len.to_le_bytes());
                out.extend_from_slice(&entry_count.to_le_bytes());
                encode_tag(tag, out);
            }
            JournalEntry::Repeat { tag } => {
                out.push(JOURNAL_REPEAT);
                encode_tag(tag, out);
            }
            JournalEntry::Reverted => out.push(JOURNAL_REVERTED),
            JournalEntry::RolledBack => out.push(JOURNAL_ROLLED_BACK),
        }
    }

    fn decode(&self, body: &[u8]) -> Result<JournalEntry, StorageError> {
        let (&kind, mut rest) = body
            .split_first()
            .ok_or_else(|| StorageError::Malformed("empty journal entry".into()))?;
        let entry = match kind {
            JOURNAL_START => JournalEntry::Start {
                data_len: take_u64(&mut rest)?,
                entry_count: take_u64(&mut rest)?,
            },
            JOURNAL_SPENT => {
                let offset = take_u64(&mut rest)?;
                let record = UtxoCodec.decode(rest)?;
                rest = &[];
                JournalEntry::Spent(SpentEntry { offset, record })
            }
            JOURNAL_SEALED => JournalEntry::Sealed {
                data_len: take_u64(&mut rest)?,
                entry_count: take_u64(&mut rest)?,
                tag: take_tag(&mut rest)?,
            },
            JOURNAL_REPEAT => JournalEntry::Repeat {
                tag: take_tag(&mut rest)?,
            },
            JOURNAL_REVERTED => JournalEntry::Reverted,
            JOURNAL_ROLLED_BACK => JournalEntry::RolledBack,
            other => {
                return Err(StorageError::Malformed(format!("journal entry kind {other}")));
            }
        };
        if !rest.is_empty() {
            return Err(StorageError::Malformed(format!(
                "{} trailing bytes in journal entry",
                rest.len()
            )));
        }
        Ok(entry)
    }
}

fn encode_tag(tag: &Option<Key>, out: &mut Vec<u8>) {
    match tag {
        Some(tag) => {
            out.push(1);
            out.extend_from_slice(tag);
        }
        None => out.push(0),
    }
}

fn take<'a>(rest: &mut &'a [u8], n: usize) -> Result<&'a [u8], StorageError> {
    if rest.len() < n {
        return Err(StorageError::Malformed("journal entry cut short".into()));
    }
    let (head, tail) = rest.split_at(n);
    *rest = tail;
    Ok(head)
}

fn take_u64(rest: &mut &[u8]) -> Result<u64, StorageError> {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(take(rest, 8)?);
    Ok(u64::from_le_bytes(bytes))
}

fn take_tag(rest: &mut &[u8]) -> Result<Option<Key>, StorageError> {
    match take(rest, 1)?[0] {
        0 => Ok(None),
        1 => {
            let mut tag = [0u8; 32];
            tag.copy_from_slice(take(rest, 32)?);
            Ok(Some(tag))
        }
        flag => Err(StorageError::Malformed(format!("tag flag {flag}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fi_01_golomb_filters::DEFAULT_P;

    fn encode<C: RecordCodec>(codec: &C, record: &C::Record) -> Vec<u8> {
        let mut out = Vec::new();
        codec.encode(record, &mut out);
        out
    }

    #[test]
    fn test_filter_sizes() {
        let codec = FilterCodec::new(DEFAULT_P);
        let empty = StoredFilter::Filter(GolombRiceFilter::empty(DEFAULT_P));
        let one = StoredFilter::Filter(
            GolombRiceFilter::build(&[0; 16], DEFAULT_P, [&b"a"[..]]).unwrap(),
        );
        let many = StoredFilter::Filter(
            GolombRiceFilter::build(&[0; 16], DEFAULT_P, (0..50u8).map(|i| [i; 4])).unwrap(),
        );

        for record in [empty, one, many] {
            let body = encode(&codec, &record);
            assert_eq!(codec.decode(&body).unwrap(), record);
        }
    }

    #[test]
    fn test_tombstone_has_same_length_and_is_not_empty() {
        let codec = FilterCodec::new(DEFAULT_P);
        let filter = GolombRiceFilter::build(&[1; 16], DEFAULT_P, [&b"x"[..], b"y"]).unwrap();
        let live = encode(&codec, &StoredFilter::Filter(filter.clone()));
        let tomb = encode(&codec, &StoredFilter::tombstone_for(&filter));

        assert_eq!(live.len(), tomb.len());
        assert!(codec.decode(&tomb).unwrap().is_tombstone());

        let empty_tomb = encode(
            &codec,
            &StoredFilter::tombstone_for(&GolombRiceFilter::empty(DEFAULT_P)),
        );
        let empty_live = encode(&codec, &StoredFilter::Filter(GolombRiceFilter::empty(DEFAULT_P)));
        assert_ne!(
            codec.decode(&empty_tomb).unwrap(),
            codec.decode(&empty_live).unwrap()
        );
    }

    #[test]
    fn test_filter_with_other_p_is_rejected() {
        let codec = FilterCodec::new(DEFAULT_P);
        let filter = GolombRiceFilter::build(&[0; 16], 10, [&b"a"[..]]).unwrap();
        assert!(matches!(
            codec.validate(&StoredFilter::Filter(filter)),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_malformed_filter_bodies() {
        let codec = FilterCodec::new(DEFAULT_P);
        assert!(codec.decode(&[0; 4]).is_err());

        let mut body = Vec::new();
        body.extend_from_slice(&1i32.to_le_bytes());
        body.extend_from_slice(&16i32.to_le_bytes());
        body.push(0);
        assert!(codec.decode(&body).is_err());
    }

    #[test]
    fn test_utxo_body_layout() {
        let record = UtxoRecord::new(
            OutPoint {
                txid: Txid::from_byte_array([9; 32]),
                vout: 3,
            },
            ScriptBuf::from_bytes(vec![0x00, 0x14, 1, 2, 3]),
        );
        let body = encode(&UtxoCodec, &record);

        assert_eq!(body.len(), 40 + 5);
        assert_eq!(&body[32..36], &3u32.to_le_bytes());
        assert_eq!(&body[36..40], &5i32.to_le_bytes());
        assert_eq!(UtxoCodec.decode(&body).unwrap(), record);

        let tomb = encode(&UtxoCodec, &record.to_tombstone());
        assert_eq!(tomb.len(), body.len());
        assert!(UtxoCodec.decode(&tomb).unwrap().is_tombstone());
    }

    #[test]
    fn test_utxo_script_length_mismatch() {
        let mut body = vec![0u8; 40];
        body[36..40].copy_from_slice(&4i32.to_le_bytes());
        body.extend_from_slice(&[1, 2]);
        assert!(UtxoCodec.decode(&body).is_err());
    }

    #[test]
    fn test_journal_entries_decode_back() {
        let spent = SpentEntry {
            offset: 512,
            record: UtxoRecord::new(
                OutPoint {
                    txid: Txid::from_byte_array([4; 32]),
                    vout: 1,
                },
                ScriptBuf::from_bytes(vec![0x00, 0x14, 7]),
            ),
        };
        let entries = [
            JournalEntry::Start { data_len: 9, entry_count: 1 },
            JournalEntry::Spent(spent),
            JournalEntry::Sealed { data_len: 90, entry_count: 2, tag: Some([8; 32]) },
            JournalEntry::Repeat { tag: None },
            JournalEntry::Reverted,
            JournalEntry::RolledBack,
        ];
        for entry in entries {
            let body = encode(&JournalCodec, &entry);
            assert_eq!(JournalCodec.decode(&body).unwrap(), entry);
        }
    }

    #[test]
    fn test_malformed_journal_entries() {
        assert!(JournalCodec.decode(&[]).is_err());
        assert!(JournalCodec.decode(&[9]).is_err());
        assert!(JournalCodec.decode(&[JOURNAL_START, 1, 2]).is_err());
        assert!(JournalCodec.decode(&[JOURNAL_REPEAT, 2]).is_err());
        assert!(JournalCodec.decode(&[JOURNAL_REVERTED, 0]).is_err());
    }
}
