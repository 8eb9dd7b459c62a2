//! Cluster configuration: the set of servers participating in the cluster,
//! their addresses and roles (spec §3, §4.2).
//!
//! The wire encoding is a small versioned binary format, not `serde`, because
//! spec §6 requires it to be bit-exact and stable across implementations
//! (including the non-Rust ones this spec was distilled from — see
//! `examples/original_source/include/raft.h`, whose `RAFT_VOTER`/`RAFT_STANDBY`/
//! `RAFT_IDLE` integer values this module's `Role` repr matches).

use crate::error::{RaftError, Result};
use crate::ids::ServerId;
use serde::{Deserialize, Serialize};

/// The wire format version. Bumped only if the record layout changes.
const CONFIG_VERSION: u8 = 1;

/// A server's participation mode in the cluster.
///
/// Numeric values are pinned to match `RAFT_STANDBY`/`RAFT_VOTER`/`RAFT_IDLE`
/// in the canonical C header, since they cross the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Role {
    /// Replicates the log, does not participate in quorum.
    Standby = 0,
    /// Replicates the log and participates in quorum.
    Voter = 1,
    /// Neither replicates nor votes.
    Idle = 2,
}

impl Role {
    fn from_u8(v: u8) -> Result<Role> {
        match v {
            0 => Ok(Role::Standby),
            1 => Ok(Role::Voter),
            2 => Ok(Role::Idle),
            _ => Err(RaftError::BadRole),
        }
    }
}

/// A single server's membership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigServer {
    pub id: ServerId,
    pub address: String,
    pub role: Role,
}

/// The cluster membership: an ordered set of servers with unique ids and
/// unique addresses (spec §3).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    servers: Vec<ConfigServer>,
}

impl Configuration {
    pub fn new() -> Self {
        Configuration { servers: Vec::new() }
    }

    pub fn servers(&self) -> &[ConfigServer] {
        &self.servers
    }

    pub fn get(&self, id: ServerId) -> Option<&ConfigServer> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.get(id).is_some()
    }

    pub fn is_voter(&self, id: ServerId) -> bool {
        matches!(self.get(id), Some(s) if s.role == Role::Voter)
    }

    /// Adds a new server. Fails if the id is already present, the address is
    /// already in use, or (defensively) the role byte is out of range.
    pub fn add(&mut self, id: ServerId, address: String, role: Role) -> Result<()> {
        if self.servers.iter().any(|s| s.id == id) {
            return Err(RaftError::DuplicateId(id.value()));
        }
        if self.servers.iter().any(|s| s.address == address) {
            return Err(RaftError::DuplicateAddress(address));
        }
        self.servers.push(ConfigServer { id, address, role });
        Ok(())
    }

    /// Removes a server by id. No-op (not an error) if absent; callers that
    /// need to distinguish should check `contains` first.
    pub fn remove(&mut self, id: ServerId) {
        self.servers.retain(|s| s.id != id);
    }

    /// Changes an existing server's role in place.
    pub fn set_role(&mut self, id: ServerId, role: Role) -> Result<()> {
        let server = self
            .servers
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(RaftError::BadId("server not in configuration".into()))?;
        server.role = role;
        Ok(())
    }

    pub fn voter_count(&self) -> usize {
        self.servers.iter().filter(|s| s.role == Role::Voter).count()
    }

    /// Strict-majority quorum size among voters.
    pub fn quorum(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    pub fn voter_ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.servers.iter().filter(|s| s.role == Role::Voter).map(|s| s.id)
    }

    /// All servers that should receive replicated entries: voters and
    /// standbys, but not idle members (spec §3).
    pub fn replication_target_ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.servers
            .iter()
            .filter(|s| s.role != Role::Idle)
            .map(|s| s.id)
    }

    /// Encodes the configuration per spec §6:
    /// `{version: u8, n_servers: u64}` followed by `n_servers` records of
    /// `{id: u64, role: u8, address: NUL-terminated, padded to 8 bytes}`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(CONFIG_VERSION);
        buf.extend_from_slice(&(self.servers.len() as u64).to_le_bytes());

        for server in &self.servers {
            buf.extend_from_slice(&server.id.value().to_le_bytes());
            buf.push(server.role as u8);
            buf.extend_from_slice(server.address.as_bytes());
            buf.push(0); // NUL terminator

            // Pad the record (id[8] + role[1] + address + NUL) to an 8-byte
            // boundary so records stay aligned on the wire.
            let unpadded = 8 + 1 + server.address.len() + 1;
            let pad = (8 - (unpadded % 8)) % 8;
            buf.extend(std::iter::repeat(0u8).take(pad));
        }

        buf
    }

    /// Decodes a configuration previously produced by `encode`.
    pub fn decode(buf: &[u8]) -> Result<Configuration> {
        let mut pos = 0usize;
        let take = |pos: &mut usize, n: usize, buf: &[u8]| -> Result<std::ops::Range<usize>> {
            let end = pos.checked_add(n).ok_or_else(|| RaftError::Malformed("overflow".into()))?;
            if end > buf.len() {
                return Err(RaftError::Malformed("truncated configuration".into()));
            }
            let range = *pos..end;
            *pos = end;
            Ok(range)
        };

        let version_range = take(&mut pos, 1, buf)?;
        let version = buf[version_range][0];
        if version != CONFIG_VERSION {
            return Err(RaftError::Malformed(format!(
                "unsupported configuration version {}",
                version
            )));
        }

        let n_range = take(&mut pos, 8, buf)?;
        let n_servers = u64::from_le_bytes(buf[n_range].try_into().unwrap());

        let mut config = Configuration::new();
        for _ in 0..n_servers {
            let id_range = take(&mut pos, 8, buf)?;
            let id_raw = u64::from_le_bytes(buf[id_range].try_into().unwrap());
            let id = ServerId::new(id_raw).ok_or_else(|| RaftError::Malformed("zero server id".into()))?;

            let role_range = take(&mut pos, 1, buf)?;
            let role = Role::from_u8(buf[role_range][0])?;

            let nul_pos = buf[pos..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| RaftError::Malformed("unterminated address".into()))?;
            let address_range = take(&mut pos, nul_pos, buf)?;
            let address = String::from_utf8(buf[address_range].to_vec())
                .map_err(|_| RaftError::Malformed("address is not valid utf-8".into()))?;
            take(&mut pos, 1, buf)?; // NUL

            let unpadded = 8 + 1 + address.len() + 1;
            let pad = (8 - (unpadded % 8)) % 8;
            if pad > 0 {
                take(&mut pos, pad, buf)?;
            }

            config
                .add(id, address, role)
                .map_err(|e| RaftError::Malformed(e.to_string()))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(v: u64) -> ServerId {
        ServerId::new(v).unwrap()
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let mut config = Configuration::new();
        config.add(sid(1), "10.0.0.1:8000".into(), Role::Voter).unwrap();
        config.add(sid(2), "10.0.0.2:8000".into(), Role::Voter).unwrap();
        config.add(sid(3), "10.0.0.3:8000".into(), Role::Standby).unwrap();

        let encoded = config.encode();
        let decoded = Configuration::decode(&encoded).unwrap();
        assert_eq!(config, decoded);
        assert_eq!(encoded, decoded.encode());
    }

    #[test]
    fn rejects_duplicate_id_and_address() {
        let mut config = Configuration::new();
        config.add(sid(1), "a".into(), Role::Voter).unwrap();
        assert_eq!(
            config.add(sid(1), "b".into(), Role::Voter),
            Err(RaftError::DuplicateId(1))
        );
        assert_eq!(
            config.add(sid(2), "a".into(), Role::Voter),
            Err(RaftError::DuplicateAddress("a".into()))
        );
    }

    #[test]
    fn quorum_is_strict_majority_of_voters() {
        let mut config = Configuration::new();
        config.add(sid(1), "a".into(), Role::Voter).unwrap();
        config.add(sid(2), "b".into(), Role::Voter).unwrap();
        config.add(sid(3), "c".into(), Role::Voter).unwrap();
        config.add(sid(4), "d".into(), Role::Idle).unwrap();
        assert_eq!(config.voter_count(), 3);
        assert_eq!(config.quorum(), 2);
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let mut config = Configuration::new();
        config.add(sid(1), "a".into(), Role::Voter).unwrap();
        let mut encoded = config.encode();
        encoded.truncate(encoded.len() - 1);
        assert!(Configuration::decode(&encoded).is_err());
    }
}
