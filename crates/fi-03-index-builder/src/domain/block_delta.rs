//! What a transaction does to the witness output set.

use bitcoin::{OutPoint, Transaction};
use fi_01_golomb_filters::is_indexed_script;
use fi_02_record_store::UtxoRecord;

/// Outpoints `tx` spends. A coinbase spends nothing.
pub fn spent_outpoints(tx: &Transaction) -> impl Iterator<Item = OutPoint> + '_ {
    let inputs = if tx.is_coinbase() { &[][..] } else { &tx.input[..] };
    inputs.iter().map(|input| input.previous_output)
}

/// Indexed outputs `tx` creates.
pub fn created_outputs(tx: &Transaction) -> Vec<UtxoRecord> {
    let txid = tx.compute_txid();
    tx.output
        .iter()
        .enumerate()
        .filter(|(_, out)| is_indexed_script(&out.script_pubkey))
        .map(|(vout, out)| {
            UtxoRecord::new(
                OutPoint {
                    txid,
                    vout: vout as u32,
                },
                out.script_pubkey.clone(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_chain::{coinbase, p2wpkh, spend};
    use bitcoin::ScriptBuf;

    #[test]
    fn test_coinbase_spends_nothing() {
        let tx = coinbase(5, vec![p2wpkh(1)]);
        assert_eq!(spent_outpoints(&tx).count(), 0);
    }

    #[test]
    fn test_only_witness_outputs_are_created() {
        let tx = coinbase(5, vec![p2wpkh(1), ScriptBuf::new(), p2wpkh(2)]);
        let created = created_outputs(&tx);

        assert_eq!(created.len(), 2);
        assert_eq!(created[0].outpoint.vout, 0);
        assert_eq!(created[1].outpoint.vout, 2);
        assert_eq!(created[1].script, p2wpkh(2));
    }

    #[test]
    fn test_spend_lists_inputs() {
        let funding = coinbase(1, vec![p2wpkh(1)]);
        let prev = OutPoint {
            txid: funding.compute_txid(),
            vout: 0,
        };
        let tx = spend(&[prev], vec![p2wpkh(2)]);
        assert_eq!(spent_outpoints(&tx).collect::<Vec<_>>(), vec![prev]);
    }
}
