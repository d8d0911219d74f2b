use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;
use std::io::Cursor;
use std::net::SocketAddr;

use crate::network::Network;
use crate::shared::{NetworkError, NetworkResult};

/// Plain UDP service discovery: a broadcast request carrying a service id and
/// version, answered by every listening server. No crypto, tangential to the
/// transport core.
const DISCOVERY_MAGIC: [u8; 4] = [0x52, 0x4E, 0x4C, 0x64];

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;

const PACKET_SIZE: usize = 4 + 1 + 8 + 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ServiceInfo {
    pub service_id: u64,
    pub version: u32,
}

fn write_packet(kind: u8, info: ServiceInfo) -> Vec<u8> {
    let mut packet = Vec::with_capacity(PACKET_SIZE);
    packet.extend_from_slice(&DISCOVERY_MAGIC);
    packet.write_u8(kind).unwrap();
    packet.write_u64::<LittleEndian>(info.service_id).unwrap();
    packet.write_u32::<LittleEndian>(info.version).unwrap();
    packet
}

fn read_packet(buf: &[u8]) -> Option<(u8, ServiceInfo)> {
    if buf.len() != PACKET_SIZE || buf[..4] != DISCOVERY_MAGIC {
        return None;
    }

    let mut cursor = Cursor::new(&buf[4..]);
    let kind = cursor.read_u8().ok()?;
    let service_id = cursor.read_u64::<LittleEndian>().ok()?;
    let version = cursor.read_u32::<LittleEndian>().ok()?;

    Some((kind, ServiceInfo { service_id, version }))
}

/// Server half: answers matching requests arriving on its own socket.
pub struct DiscoveryServer {
    info: ServiceInfo,
}

impl DiscoveryServer {
    #[inline]
    pub fn new(info: ServiceInfo) -> DiscoveryServer {
        DiscoveryServer { info }
    }

    /// Drains pending datagrams and answers every matching request. Returns the
    /// number of responses sent.
    pub fn answer_pending(&self, network: &mut dyn Network) -> NetworkResult<usize> {
        let mut buf = [0u8; 64];
        let mut answered = 0;

        loop {
            let (count, from) = match network.recv_from(&mut buf) {
                Ok(received) => received,
                Err(NetworkError::Wait) => return Ok(answered),
                Err(err) => return Err(err),
            };

            match read_packet(&buf[..count]) {
                Some((KIND_REQUEST, info)) if info.service_id == self.info.service_id => {
                    network.send_to(&write_packet(KIND_RESPONSE, self.info), from)?;
                    answered += 1;
                }
                _ => {}
            }
        }
    }
}

/// Client half: broadcasts probes and collects responders.
pub struct DiscoveryClient {
    info: ServiceInfo,
    found: IndexMap<SocketAddr, ServiceInfo>,
}

impl DiscoveryClient {
    #[inline]
    pub fn new(info: ServiceInfo) -> DiscoveryClient {
        DiscoveryClient {
            info,
            found: IndexMap::new(),
        }
    }

    /// Sends one probe towards `target` (usually a broadcast address).
    pub fn probe(&self, network: &mut dyn Network, target: SocketAddr) -> NetworkResult<()> {
        network.send_to(&write_packet(KIND_REQUEST, self.info), target)?;
        Ok(())
    }

    /// Drains pending responses into the responder table.
    pub fn collect(&mut self, network: &mut dyn Network) -> NetworkResult<()> {
        let mut buf = [0u8; 64];

        loop {
            let (count, from) = match network.recv_from(&mut buf) {
                Ok(received) => received,
                Err(NetworkError::Wait) => return Ok(()),
                Err(err) => return Err(err),
            };

            if let Some((KIND_RESPONSE, info)) = read_packet(&buf[..count]) {
                if info.service_id == self.info.service_id {
                    self.found.insert(from, info);
                }
            }
        }
    }

    /// Responders discovered so far, in first-seen order.
    #[inline]
    pub fn responders(&self) -> &IndexMap<SocketAddr, ServiceInfo> {
        &self.found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryMesh;

    fn addr(port: u16) -> SocketAddr {
        format!("10.1.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_probe_and_answer() {
        let mesh = MemoryMesh::new();
        let mut server_net = mesh.endpoint(addr(1)).unwrap();
        let mut client_net = mesh.endpoint(addr(2)).unwrap();

        let info = ServiceInfo {
            service_id: 0xFEED,
            version: 3,
        };

        let server = DiscoveryServer::new(info);
        let mut client = DiscoveryClient::new(info);

        client.probe(&mut client_net, addr(1)).unwrap();
        assert_eq!(server.answer_pending(&mut server_net).unwrap(), 1);

        client.collect(&mut client_net).unwrap();
        assert_eq!(client.responders().len(), 1);
        assert_eq!(client.responders()[&addr(1)], info);
    }

    #[test]
    fn test_mismatched_service_ignored() {
        let mesh = MemoryMesh::new();
        let mut server_net = mesh.endpoint(addr(1)).unwrap();
        let mut client_net = mesh.endpoint(addr(2)).unwrap();

        let server = DiscoveryServer::new(ServiceInfo {
            service_id: 1,
            version: 1,
        });
        let client = DiscoveryClient::new(ServiceInfo {
            service_id: 2,
            version: 1,
        });

        client.probe(&mut client_net, addr(1)).unwrap();
        assert_eq!(server.answer_pending(&mut server_net).unwrap(), 0);
    }

    #[test]
    fn test_garbage_ignored() {
        let mesh = MemoryMesh::new();
        let mut server_net = mesh.endpoint(addr(1)).unwrap();
        let mut noise = mesh.endpoint(addr(3)).unwrap();

        noise.send_to(b"not a probe", addr(1)).unwrap();
        let server = DiscoveryServer::new(ServiceInfo {
            service_id: 1,
            version: 1,
        });
        assert_eq!(server.answer_pending(&mut server_net).unwrap(), 0);
    }
}
