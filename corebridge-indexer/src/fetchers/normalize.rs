// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Normalization of raw EVM transactions into [`SystemTx`] records.
//!
//! Both fetcher variants feed their provider-specific wire types through the
//! same two functions here, so matching logic never learns whether a transfer
//! was a native-value transaction or an ERC-20 call.

use ethers::types::{Address, Bytes, H160, H256, U256};
use ethers::utils::keccak256;
use ethers::utils::rlp::RlpStream;

use super::SystemTx;
use crate::assets::NATIVE_SYSTEM_ADDRESS;

/// `transfer(address,uint256)` function selector.
const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// `keccak256("Transfer(address,address,uint256)")`.
const TRANSFER_EVENT_TOPIC: H256 = H256([
    0xdd, 0xf2, 0x52, 0xad, 0x1b, 0xe2, 0xc8, 0x9b, 0x69, 0xc2, 0xb0, 0x68, 0xfc, 0x37, 0x8d,
    0xaa, 0x95, 0x2b, 0xa7, 0xf1, 0x63, 0xc4, 0xa1, 0x16, 0x28, 0xf5, 0x5a, 0x4d, 0xf5, 0x23,
    0xb3, 0xef,
]);

/// Length of `transfer(address,uint256)` calldata: selector + two words.
const TRANSFER_CALLDATA_LEN: usize = 4 + 32 + 32;

/// [`NATIVE_SYSTEM_ADDRESS`] as an address value.
const NATIVE_SYSTEM_H160: H160 = H160([0x22; 20]);

/// The provider-independent shape of a system transaction as fetched.
#[derive(Debug, Clone)]
pub struct RawEvmTx {
    pub nonce: U256,
    pub gas_price: U256,
    pub gas: U256,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    /// Receipt logs of this transaction, needed to recover the sender of
    /// contract transfers.
    pub logs: Vec<RawEvmLog>,
}

#[derive(Debug, Clone)]
pub struct RawEvmLog {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

fn hex_addr(address: &Address) -> String {
    format!("0x{:x}", address)
}

/// Compute the two bridge identifiers of a system transaction.
///
/// Both are keccak-256 over the canonical legacy RLP encoding; they differ
/// only in the signature fields. The internal hash uses
/// `(v, r, s) = (chainId*2 + 35, 0, 0)`; the explorer hash (the one block
/// explorers display) uses `(chainId*2 + 36, 1, <sender system address>)`.
pub fn system_tx_hashes(
    tx: &RawEvmTx,
    sender_system_address: &Address,
    chain_id: u64,
) -> (String, String) {
    let internal = keccak256(encode_with_signature(
        tx,
        chain_id * 2 + 35,
        U256::zero(),
        U256::zero(),
    ));
    let explorer = keccak256(encode_with_signature(
        tx,
        chain_id * 2 + 36,
        U256::one(),
        U256::from_big_endian(sender_system_address.as_bytes()),
    ));
    (
        format!("0x{}", hex::encode(internal)),
        format!("0x{}", hex::encode(explorer)),
    )
}

fn encode_with_signature(tx: &RawEvmTx, v: u64, r: U256, s: U256) -> Vec<u8> {
    let mut stream = RlpStream::new();
    stream.begin_list(9);
    stream.append(&tx.nonce);
    stream.append(&tx.gas_price);
    stream.append(&tx.gas);
    match &tx.to {
        Some(to) => stream.append(to),
        None => stream.append(&""),
    };
    stream.append(&tx.value);
    stream.append(&tx.input.to_vec());
    stream.append(&v);
    stream.append(&r);
    stream.append(&s);
    stream.out().to_vec()
}

/// Normalize a raw transaction into a [`SystemTx`], or `None` if it is not a
/// recognizable asset transfer.
///
/// Native transfer: empty input, positive value; the sender is the native
/// token's system address. Contract transfer: ERC-20 `transfer` calldata; the
/// sender comes from the contract's `Transfer` event log (first indexed
/// topic). A contract call without a matching log is skipped.
pub fn normalize_system_tx(tx: &RawEvmTx, chain_id: u64) -> Option<SystemTx> {
    if tx.input.is_empty() {
        if tx.value.is_zero() {
            return None;
        }
        let to = tx.to?;
        let (internal_hash, explorer_hash) = system_tx_hashes(tx, &NATIVE_SYSTEM_H160, chain_id);
        return Some(SystemTx {
            internal_hash,
            explorer_hash,
            from: NATIVE_SYSTEM_ADDRESS.to_string(),
            asset_recipient: hex_addr(&to),
            amount_smallest_unit: tx.value,
            contract_address: None,
        });
    }

    if tx.input.len() != TRANSFER_CALLDATA_LEN || tx.input[..4] != ERC20_TRANSFER_SELECTOR {
        return None;
    }
    let contract = tx.to?;
    let recipient = Address::from_slice(&tx.input[16..36]);
    let amount = U256::from_big_endian(&tx.input[36..68]);

    let sender = tx.logs.iter().find_map(|log| {
        (log.address == contract && log.topics.len() >= 3 && log.topics[0] == TRANSFER_EVENT_TOPIC)
            .then(|| Address::from_slice(&log.topics[1].as_bytes()[12..]))
    })?;

    let (internal_hash, explorer_hash) = system_tx_hashes(tx, &sender, chain_id);
    Some(SystemTx {
        internal_hash,
        explorer_hash,
        from: hex_addr(&sender),
        asset_recipient: hex_addr(&recipient),
        amount_smallest_unit: amount,
        contract_address: Some(hex_addr(&contract)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::system_address_for_index;

    const CHAIN_ID: u64 = 999;

    fn addr(byte: u8) -> Address {
        Address::from([byte; 20])
    }

    fn parse_addr(s: &str) -> Address {
        Address::from_slice(&hex::decode(&s[2..]).unwrap())
    }

    fn native_tx(value: u64) -> RawEvmTx {
        RawEvmTx {
            nonce: U256::from(1),
            gas_price: U256::zero(),
            gas: U256::from(30_000_000u64),
            to: Some(addr(0xaa)),
            value: U256::from(value),
            input: Bytes::new(),
            logs: vec![],
        }
    }

    fn transfer_calldata(recipient: Address, amount: U256) -> Bytes {
        let mut data = Vec::with_capacity(TRANSFER_CALLDATA_LEN);
        data.extend_from_slice(&ERC20_TRANSFER_SELECTOR);
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(recipient.as_bytes());
        let mut word = [0u8; 32];
        amount.to_big_endian(&mut word);
        data.extend_from_slice(&word);
        Bytes::from(data)
    }

    fn transfer_log(contract: Address, sender: Address, recipient: Address) -> RawEvmLog {
        let mut from_topic = [0u8; 32];
        from_topic[12..].copy_from_slice(sender.as_bytes());
        let mut to_topic = [0u8; 32];
        to_topic[12..].copy_from_slice(recipient.as_bytes());
        RawEvmLog {
            address: contract,
            topics: vec![
                TRANSFER_EVENT_TOPIC,
                H256(from_topic),
                H256(to_topic),
            ],
            data: Bytes::new(),
        }
    }

    #[test]
    fn test_transfer_event_topic_matches_signature() {
        let computed = keccak256("Transfer(address,address,uint256)".as_bytes());
        assert_eq!(H256(computed), TRANSFER_EVENT_TOPIC);
    }

    #[test]
    fn test_native_transfer_normalizes() {
        let tx = native_tx(100_500);
        let normalized = normalize_system_tx(&tx, CHAIN_ID).unwrap();
        assert_eq!(normalized.from, NATIVE_SYSTEM_ADDRESS);
        assert_eq!(
            normalized.asset_recipient,
            "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
        );
        assert_eq!(normalized.amount_smallest_unit, U256::from(100_500u64));
        assert!(normalized.contract_address.is_none());
    }

    #[test]
    fn test_zero_value_empty_input_is_not_a_transfer() {
        let tx = native_tx(0);
        assert!(normalize_system_tx(&tx, CHAIN_ID).is_none());
    }

    #[test]
    fn test_contract_transfer_normalizes() {
        let contract = addr(0xcc);
        let sender = parse_addr(&system_address_for_index(5));
        let recipient = addr(0xbb);
        let amount = U256::from(42_000u64);
        let tx = RawEvmTx {
            nonce: U256::from(9),
            gas_price: U256::zero(),
            gas: U256::from(100_000u64),
            to: Some(contract),
            value: U256::zero(),
            input: transfer_calldata(recipient, amount),
            logs: vec![transfer_log(contract, sender, recipient)],
        };
        let normalized = normalize_system_tx(&tx, CHAIN_ID).unwrap();
        assert_eq!(normalized.from, system_address_for_index(5));
        assert_eq!(normalized.asset_recipient, hex_addr(&recipient));
        assert_eq!(normalized.amount_smallest_unit, amount);
        assert_eq!(normalized.contract_address, Some(hex_addr(&contract)));
    }

    #[test]
    fn test_contract_transfer_without_log_is_skipped() {
        let contract = addr(0xcc);
        let tx = RawEvmTx {
            nonce: U256::from(9),
            gas_price: U256::zero(),
            gas: U256::from(100_000u64),
            to: Some(contract),
            value: U256::zero(),
            input: transfer_calldata(addr(0xbb), U256::from(1u64)),
            // Log emitted by a different contract does not count.
            logs: vec![transfer_log(addr(0xdd), addr(0x11), addr(0xbb))],
        };
        assert!(normalize_system_tx(&tx, CHAIN_ID).is_none());
    }

    #[test]
    fn test_unrelated_calldata_is_skipped() {
        let mut tx = native_tx(0);
        tx.to = Some(addr(0xcc));
        tx.input = Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(normalize_system_tx(&tx, CHAIN_ID).is_none());
    }

    #[test]
    fn test_hashes_are_deterministic_and_distinct() {
        let tx = native_tx(77);
        let (internal_a, explorer_a) = system_tx_hashes(&tx, &NATIVE_SYSTEM_H160, CHAIN_ID);
        let (internal_b, explorer_b) = system_tx_hashes(&tx, &NATIVE_SYSTEM_H160, CHAIN_ID);
        assert_eq!(internal_a, internal_b);
        assert_eq!(explorer_a, explorer_b);
        // The two identifiers differ only in (v, r, s) but must never collide.
        assert_ne!(internal_a, explorer_a);
        assert_eq!(internal_a.len(), 66);
        assert!(internal_a.starts_with("0x"));
    }

    #[test]
    fn test_hashes_depend_on_chain_id_and_sender() {
        let tx = native_tx(77);
        let (internal_a, explorer_a) = system_tx_hashes(&tx, &NATIVE_SYSTEM_H160, CHAIN_ID);
        let (internal_b, _) = system_tx_hashes(&tx, &NATIVE_SYSTEM_H160, CHAIN_ID + 1);
        assert_ne!(internal_a, internal_b);
        // The sender only enters the explorer hash.
        let other_sender = parse_addr(&system_address_for_index(5));
        let (internal_c, explorer_c) = system_tx_hashes(&tx, &other_sender, CHAIN_ID);
        assert_eq!(internal_a, internal_c);
        assert_ne!(explorer_a, explorer_c);
    }
}
