//! Wire form of stats announcements.
//!
//! Stats packets are published as `<instance-id> T<map>` so subscribers can
//! filter by instance prefix. The map's `type` key selects the record kind.

use bytes::{Bytes, BytesMut};

use gripd_x::stats::{ConnectionKind, StatsPacket};

use crate::tnetstring::{self, MapBuilder, TnValue};
use crate::{Result, WireError};

/// Encode a stats packet with the publishing instance's prefix.
pub fn encode(instance_id: &Bytes, packet: &StatsPacket) -> Bytes {
    let value = match packet {
        StatsPacket::Connected {
            id,
            route,
            kind,
            peer_address,
            ssl,
            ttl,
        } => {
            let mut map = MapBuilder::new()
                .put("type", TnValue::string("conn"))
                .put("id", TnValue::Bytes(id.clone()))
                .put("route", TnValue::Bytes(route.clone()))
                .put(
                    "conn-type",
                    TnValue::string(match kind {
                        ConnectionKind::Http => "http",
                        ConnectionKind::WebSocket => "ws",
                    }),
                )
                .put("ttl", TnValue::Int(ttl.as_secs() as i64));
            if let Some(addr) = peer_address {
                map = map.put("peer-address", TnValue::string(addr));
            }
            if *ssl {
                map = map.put("ssl", TnValue::Bool(true));
            }
            map.build()
        }
        StatsPacket::Disconnected { id, route } => MapBuilder::new()
            .put("type", TnValue::string("conn-gone"))
            .put("id", TnValue::Bytes(id.clone()))
            .put("route", TnValue::Bytes(route.clone()))
            .build(),
        StatsPacket::Subscribed {
            mode,
            channel,
            subscribers,
            ttl,
        } => MapBuilder::new()
            .put("type", TnValue::string("sub"))
            .put("mode", TnValue::Bytes(mode.clone()))
            .put("channel", TnValue::Bytes(channel.clone()))
            .put("subscribers", TnValue::Int(*subscribers as i64))
            .put("ttl", TnValue::Int(ttl.as_secs() as i64))
            .build(),
        StatsPacket::Unsubscribed { mode, channel } => MapBuilder::new()
            .put("type", TnValue::string("unsub"))
            .put("mode", TnValue::Bytes(mode.clone()))
            .put("channel", TnValue::Bytes(channel.clone()))
            .build(),
        StatsPacket::Report {
            route,
            connections_max,
            connection_minutes,
            messages_received,
            messages_sent,
        } => MapBuilder::new()
            .put("type", TnValue::string("report"))
            .put("route", TnValue::Bytes(route.clone()))
            .put("connections-max", TnValue::Int(*connections_max as i64))
            .put(
                "connection-minutes",
                TnValue::Int(*connection_minutes as i64),
            )
            .put("messages-received", TnValue::Int(*messages_received as i64))
            .put("messages-sent", TnValue::Int(*messages_sent as i64))
            .build(),
    };

    let mut out = BytesMut::new();
    out.extend_from_slice(instance_id);
    out.extend_from_slice(b" T");
    tnetstring::encode(&value, &mut out);
    out.freeze()
}

/// Split a published stats message into the instance prefix and its map.
pub fn decode(input: &Bytes) -> Result<(Bytes, TnValue)> {
    let space = input
        .iter()
        .position(|&b| b == b' ')
        .ok_or(WireError::Malformed("missing instance prefix"))?;
    let instance = input.slice(..space);
    let rest = input.slice(space + 1..);
    if rest.first() != Some(&b'T') {
        return Err(WireError::Malformed("missing format tag"));
    }
    let value = tnetstring::decode(&rest.slice(1..))?;
    Ok((instance, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connected_roundtrip() {
        let packet = StatsPacket::Connected {
            id: Bytes::from_static(b"c1"),
            route: Bytes::from_static(b"r1"),
            kind: ConnectionKind::WebSocket,
            peer_address: Some("10.0.0.1".into()),
            ssl: true,
            ttl: Duration::from_secs(120),
        };
        let encoded = encode(&Bytes::from_static(b"inst-a"), &packet);
        assert!(encoded.starts_with(b"inst-a T"));

        let (instance, value) = decode(&encoded).unwrap();
        assert_eq!(instance.as_ref(), b"inst-a");
        assert_eq!(value.get("type").unwrap().as_str(), Some("conn"));
        assert_eq!(value.get("ttl").unwrap().as_int(), Some(120));
        assert_eq!(value.get("ssl").unwrap().as_bool(), Some(true));
    }

    #[test]
    fn report_fields_present() {
        let packet = StatsPacket::Report {
            route: Bytes::from_static(b"r"),
            connections_max: 4,
            connection_minutes: 12,
            messages_received: 100,
            messages_sent: 90,
        };
        let (_, value) = decode(&encode(&Bytes::from_static(b"i"), &packet)).unwrap();
        assert_eq!(value.get("connections-max").unwrap().as_int(), Some(4));
        assert_eq!(value.get("connection-minutes").unwrap().as_int(), Some(12));
    }

    #[test]
    fn missing_prefix_rejected() {
        assert!(decode(&Bytes::from_static(b"T0:~")).is_err());
    }
}
