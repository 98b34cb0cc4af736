//! The connect-ack handshake (C3): runs once, with blocking I/O, on every freshly accepted
//! socket, before it is handed to the non-blocking reactor.

use crate::net::wire::{FrameType, Header};
use crate::peer::{PeerId, PeerTable};
use pmix_util::error::{PmixError, PmixResult, STATUS_SUCCESS};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

/// Host-side authentication upcall, invoked only for `IDENT_PMIX` handshakes where the host
/// registered one. Absence means identity-table membership alone authorizes the peer, which is
/// how PMI1/PMI2-style clients (arriving with a non-PMIX frame type) are always treated.
pub trait Authenticator {
    fn authenticate(&self, token: &[u8]) -> bool;
}

/// Runs the handshake on a blocking, freshly accepted socket. On success the socket is bound
/// into `table` and left in blocking mode; the caller is responsible for switching it to
/// non-blocking and arming reactor events afterward (§4.3 step 7).
pub fn run_handshake(
    mut stream: UnixStream,
    server_version: &str,
    max_cred_size: usize,
    authenticator: Option<&dyn Authenticator>,
    table: &mut PeerTable,
) -> PmixResult<PeerId> {
    let hdr = Header::read(&mut stream)?;

    if hdr.nbytes as usize > max_cred_size {
        reply_status(&mut stream, &hdr, PmixError::BadParam.status_code())?;
        return Err(PmixError::BadParam);
    }

    let mut payload = vec![0u8; hdr.nbytes as usize];
    stream.read_exact(&mut payload)?;

    let version_end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let version = std::str::from_utf8(&payload[..version_end]).map_err(|_| PmixError::BadParam)?;

    if version != server_version {
        reply_status(&mut stream, &hdr, PmixError::NotSupported.status_code())?;
        return Err(PmixError::NotSupported);
    }

    let namespace = hdr.namespace_str().to_owned();
    let rank = hdr.rank;

    if hdr.msg_type == FrameType::IdentPmix {
        if let Some(auth) = authenticator {
            if hdr.nbytes as usize <= version_end + 1 {
                reply_status(&mut stream, &hdr, PmixError::InvalidArg.status_code())?;
                return Err(PmixError::InvalidArg);
            }
            let token = &payload[version_end + 1..];
            if !auth.authenticate(token) {
                reply_status(&mut stream, &hdr, PmixError::Unreach.status_code())?;
                return Err(PmixError::Unreach);
            }
        }
    }

    reply_status(&mut stream, &hdr, STATUS_SUCCESS)?;
    stream.set_nonblocking(true)?;
    let evented = mio_uds::UnixStream::from_stream(stream)?;

    table.bind_socket(&namespace, rank, evented)
}

fn reply_status<W: Write>(stream: &mut W, request: &Header, status: i32) -> PmixResult<()> {
    let payload = status.to_ne_bytes();
    let reply_hdr = Header::new(
        request.namespace_str(),
        request.rank,
        FrameType::IdentPmix,
        0,
        payload.len() as u32,
    );
    reply_hdr.write(stream)?;
    stream.write_all(&payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::wire::MAX_CRED_SIZE;
    use std::convert::TryInto;

    struct AlwaysAccept;
    impl Authenticator for AlwaysAccept {
        fn authenticate(&self, _token: &[u8]) -> bool {
            true
        }
    }

    struct AlwaysReject;
    impl Authenticator for AlwaysReject {
        fn authenticate(&self, _token: &[u8]) -> bool {
            false
        }
    }

    fn send_handshake(stream: &mut UnixStream, namespace: &str, rank: i32, version: &str, token: Option<&[u8]>) {
        let mut payload = Vec::new();
        payload.extend_from_slice(version.as_bytes());
        payload.push(0);
        if let Some(t) = token {
            payload.extend_from_slice(t);
        }
        let msg_type = if token.is_some() { FrameType::IdentPmix } else { FrameType::User };
        let hdr = Header::new(namespace, rank, msg_type, 0, payload.len() as u32);
        hdr.write(stream).unwrap();
        stream.write_all(&payload).unwrap();
    }

    #[test]
    fn handshake_binds_matching_identity() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut table = PeerTable::new();
        table.register_expected("job1", 0);

        send_handshake(&mut client, "job1", 0, "1.0", None);

        let id = run_handshake(server, "1.0", MAX_CRED_SIZE, None, &mut table).unwrap();
        assert!(table.get(id).unwrap().is_live());

        let mut status = [0u8; Header::SIZE + 4];
        client.read_exact(&mut status).unwrap();
        let returned = i32::from_ne_bytes(status[Header::SIZE..].try_into().unwrap());
        assert_eq!(returned, STATUS_SUCCESS);
    }

    #[test]
    fn handshake_rejects_version_mismatch() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut table = PeerTable::new();
        table.register_expected("job1", 0);
        send_handshake(&mut client, "job1", 0, "2.0", None);

        let err = run_handshake(server, "1.0", MAX_CRED_SIZE, None, &mut table).unwrap_err();
        assert_eq!(err, PmixError::NotSupported);
    }

    #[test]
    fn handshake_rejects_unknown_identity() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut table = PeerTable::new();
        send_handshake(&mut client, "job1", 0, "1.0", None);

        let err = run_handshake(server, "1.0", MAX_CRED_SIZE, None, &mut table).unwrap_err();
        assert_eq!(err, PmixError::Unknown);
    }

    #[test]
    fn handshake_rejects_failed_authentication() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut table = PeerTable::new();
        table.register_expected("job1", 0);
        send_handshake(&mut client, "job1", 0, "1.0", Some(b"bad-token"));

        let err = run_handshake(server, "1.0", MAX_CRED_SIZE, Some(&AlwaysReject), &mut table).unwrap_err();
        assert_eq!(err, PmixError::Unreach);
    }

    #[test]
    fn handshake_accepts_valid_token() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut table = PeerTable::new();
        table.register_expected("job1", 0);
        send_handshake(&mut client, "job1", 0, "1.0", Some(b"good-token"));

        let id = run_handshake(server, "1.0", MAX_CRED_SIZE, Some(&AlwaysAccept), &mut table).unwrap();
        assert!(table.get(id).unwrap().is_live());
    }
}
