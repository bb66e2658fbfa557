use lon_proto::{
    AuthHeader, AuthKind, Destination, DomainId, NpduHeader, PduType, PduVersion, ProtoError,
    SpduHeader, SpduKind, SubnetNode, TpduHeader, TpduKind, TransId,
};

#[test]
fn npdu_subnet_node_exact_bytes() {
    let header = NpduHeader {
        priority: true,
        alt_path: false,
        delta_backlog: 1,
        version: PduVersion::Legacy,
        pdu_type: PduType::Tpdu,
        source: SubnetNode::new(3, 17),
        dest: Destination::SubnetNode { subnet: 1, node: 2 },
        domain: DomainId::new(&[0x49]),
    };
    let bytes = header.encode(&[0x05, 0x30]);

    // byte 0: priority=1, alt=0, backlog=1           -> 0x81
    // byte 1: version=0, type=TPDU(0), fmt=2, dlen=1 -> 0b00_00_10_01
    // byte 2: source subnet 3
    // byte 3: selector(2a)=1 | node 17               -> 0x91
    // bytes 4-5: destination subnet 1, node 2
    // byte 6: domain id 0x49
    // bytes 7-8: enclosed
    assert_eq!(bytes, vec![0x81, 0b0000_1001, 3, 0x91, 1, 2, 0x49, 0x05, 0x30]);

    let (decoded, enclosed) = NpduHeader::decode(&bytes).unwrap();
    assert_eq!(decoded, header);
    assert_eq!(enclosed, &[0x05, 0x30]);
}

#[test]
fn npdu_group_ack_uses_clear_selector() {
    let header = NpduHeader {
        priority: false,
        alt_path: true,
        delta_backlog: 0,
        version: PduVersion::Legacy,
        pdu_type: PduType::Tpdu,
        source: SubnetNode::new(9, 4),
        dest: Destination::GroupAck {
            subnet: 2,
            node: 5,
            group: 7,
            member: 3,
        },
        domain: DomainId::empty(),
    };
    let bytes = header.encode(&[]);
    // Source node byte must have the selector bit clear for format 2b.
    assert_eq!(bytes[3], 4);
    let (decoded, _) = NpduHeader::decode(&bytes).unwrap();
    assert_eq!(decoded.dest, header.dest);
    assert_eq!(decoded.source, header.source);
}

#[test]
fn npdu_broadcast_and_unique_id_roundtrip() {
    for dest in [
        Destination::Broadcast { subnet: 0 },
        Destination::Broadcast { subnet: 12 },
        Destination::Group { group: 200 },
        Destination::UniqueId {
            subnet: 1,
            unique_id: [1, 2, 3, 4, 5, 6],
        },
    ] {
        let header = NpduHeader {
            priority: false,
            alt_path: false,
            delta_backlog: 15,
            version: PduVersion::Legacy,
            pdu_type: PduType::Apdu,
            source: SubnetNode::new(1, 1),
            dest,
            domain: DomainId::new(&[0xAA, 0xBB, 0xCC]),
        };
        let bytes = header.encode(&[0xFF]);
        let (decoded, enclosed) = NpduHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(enclosed, &[0xFF]);
    }
}

#[test]
fn npdu_truncated_is_rejected() {
    let header = NpduHeader {
        priority: false,
        alt_path: false,
        delta_backlog: 0,
        version: PduVersion::Legacy,
        pdu_type: PduType::Tpdu,
        source: SubnetNode::new(1, 1),
        dest: Destination::UniqueId {
            subnet: 1,
            unique_id: [9; 6],
        },
        domain: DomainId::new(&[1, 2, 3, 4, 5, 6]),
    };
    let bytes = header.encode(&[]);
    for len in 0..bytes.len() {
        assert_eq!(
            NpduHeader::decode(&bytes[..len]).unwrap_err(),
            ProtoError::Truncated,
            "prefix of {len} bytes must not decode"
        );
    }
}

#[test]
fn tpdu_legacy_first_byte() {
    let header = TpduHeader {
        auth: true,
        kind: TpduKind::Ackd,
        tid: TransId(0x0D),
    };
    let mut out = Vec::new();
    header.encode_into(PduVersion::Legacy, &mut out);
    // auth=1, kind=0, tid=0xD
    assert_eq!(out, vec![0x8D]);

    let (decoded, rest) = TpduHeader::decode(&out, PduVersion::Legacy).unwrap();
    assert_eq!(decoded, header);
    assert!(rest.is_empty());
}

#[test]
fn tpdu_enhanced_splits_tid() {
    let header = TpduHeader {
        auth: false,
        kind: TpduKind::Ack,
        tid: TransId(0x0A5C),
    };
    let mut out = Vec::new();
    header.encode_into(PduVersion::Enhanced, &mut out);
    // kind=2 in bits 6-4, tid high nibble 0xA, then low byte 0x5C.
    assert_eq!(out, vec![0x2A, 0x5C]);
    let (decoded, _) = TpduHeader::decode(&out, PduVersion::Enhanced).unwrap();
    assert_eq!(decoded.tid, TransId(0x0A5C));
}

#[test]
fn spdu_kinds_roundtrip() {
    for kind in [
        SpduKind::Request,
        SpduKind::Response,
        SpduKind::Reminder,
        SpduKind::RemMsg,
    ] {
        let header = SpduHeader {
            auth: false,
            kind,
            tid: TransId(5),
        };
        let mut out = Vec::new();
        header.encode_into(PduVersion::Legacy, &mut out);
        let (decoded, _) = SpduHeader::decode(&out, PduVersion::Legacy).unwrap();
        assert_eq!(decoded, header);
    }
    // Kind 1 is not an SPDU.
    assert_eq!(
        SpduHeader::decode(&[0x10], PduVersion::Legacy).unwrap_err(),
        ProtoError::UnknownSpdu(1)
    );
}

#[test]
fn auth_header_group_byte() {
    let header = AuthHeader {
        kind: AuthKind::Challenge,
        tid: TransId(3),
        group: Some(7),
    };
    let mut out = Vec::new();
    header.encode_into(PduVersion::Legacy, &mut out);
    out.extend_from_slice(&[0u8; 8]); // nonce follows
    assert_eq!(out[0], 0x83);
    assert_eq!(out[1], 7);

    let (decoded, body) = AuthHeader::decode(&out, PduVersion::Legacy).unwrap();
    assert_eq!(decoded, header);
    assert_eq!(body.len(), 8);

    let plain = AuthHeader {
        kind: AuthKind::ReplyOma,
        tid: TransId(3),
        group: None,
    };
    let mut out = Vec::new();
    plain.encode_into(PduVersion::Legacy, &mut out);
    assert_eq!(out, vec![0x33]);
}
