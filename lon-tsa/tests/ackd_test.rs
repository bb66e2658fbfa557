//! Acknowledged unicast service: §-by-§ happy path, retry exhaustion and
//! broadcast ack handling.

use lon_proto::{
    Destination, DomainId, NpduHeader, PduType, PduVersion, SubnetNode, TpduHeader, TpduKind,
    TransId,
};
use lon_tsa::tables::{AuthKey, DomainEntry, Tables};
use lon_tsa::{
    AppEvent, DomainRef, Millis, SendRequest, ServiceType, Stack, StackConfig,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

const DOMAIN: &[u8] = &[0x49];

fn tables(subnet: u8, node: u8) -> Tables {
    Tables {
        domains: vec![DomainEntry {
            id: DomainId::new(DOMAIN),
            subnet,
            node,
            key: AuthKey::Std([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]),
        }],
        groups: vec![],
    }
}

fn new_stack(subnet: u8, node: u8) -> Stack {
    let cfg = StackConfig {
        reset_delay_ms: 0,
        ..StackConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(42);
    Stack::new(cfg, tables(subnet, node), &mut rng, Millis(0)).unwrap()
}

fn ackd_request(dest_node: u8) -> SendRequest {
    SendRequest {
        tag: 9,
        service: ServiceType::Acked,
        dest: Destination::SubnetNode {
            subnet: 1,
            node: dest_node,
        },
        domain: DomainRef::Index(0),
        retries: 3,
        tx_timer_ms: 96,
        apdu: lon_proto::Apdu::from_slice(&[0x30, 0xAA]).unwrap(),
        ..SendRequest::default()
    }
}

fn decode_tpdu(frame: &lon_tsa::OutgoingFrame) -> (NpduHeader, TpduHeader, Vec<u8>) {
    let (header, body) = NpduHeader::decode(frame.as_slice()).unwrap();
    assert_eq!(header.pdu_type, PduType::Tpdu);
    let (tpdu, rest) = TpduHeader::decode(body, header.version).unwrap();
    (header, tpdu, rest.to_vec())
}

fn ack_from(peer: SubnetNode, us: SubnetNode, tid: TransId) -> lon_tsa::IncomingFrame {
    let header = NpduHeader {
        priority: false,
        alt_path: false,
        delta_backlog: 0,
        version: PduVersion::Legacy,
        pdu_type: PduType::Tpdu,
        source: peer,
        dest: Destination::SubnetNode {
            subnet: us.subnet,
            node: us.node,
        },
        domain: DomainId::new(DOMAIN),
    };
    let mut enclosed = Vec::new();
    TpduHeader {
        auth: false,
        kind: TpduKind::Ack,
        tid,
    }
    .encode_into(PduVersion::Legacy, &mut enclosed);
    lon_tsa::IncomingFrame::new(&header.encode(&enclosed)).unwrap()
}

#[test]
fn acknowledged_unicast_success() {
    let mut stack = new_stack(3, 17);
    stack.send(ackd_request(2)).unwrap();
    stack.service(Millis(0));

    let frame = stack.pop_npdu().expect("initial emission");
    let (header, tpdu, apdu) = decode_tpdu(&frame);
    assert_eq!(tpdu.kind, TpduKind::Ackd);
    assert!(!tpdu.auth);
    assert_eq!(apdu, vec![0x30, 0xAA]);
    assert_eq!(
        header.dest,
        Destination::SubnetNode { subnet: 1, node: 2 }
    );
    assert_eq!(header.source, SubnetNode::new(3, 17));

    stack
        .push_npdu(ack_from(
            SubnetNode::new(1, 2),
            SubnetNode::new(3, 17),
            tpdu.tid,
        ))
        .unwrap();
    stack.service(Millis(10));

    assert_eq!(
        stack.next_event(),
        Some(AppEvent::Completion {
            tag: 9,
            success: true
        })
    );
    // No retries after success.
    for t in (100..500).step_by(50) {
        stack.service(Millis(t));
    }
    assert!(stack.pop_npdu().is_none());
    assert_eq!(stack.stats().transaction_timeouts, 0);
}

#[test]
fn acknowledged_unicast_timeout() {
    let mut stack = new_stack(3, 17);
    stack.send(ackd_request(2)).unwrap();

    // Initial emission plus three retries at 96 ms intervals.
    let mut emissions = Vec::new();
    for t in [0u32, 96, 192, 288, 384, 480] {
        stack.service(Millis(t));
        while let Some(frame) = stack.pop_npdu() {
            emissions.push((t, frame));
        }
    }
    assert_eq!(emissions.len(), 4, "initial send + 3 retries");
    assert_eq!(
        emissions.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
        vec![0, 96, 192, 288]
    );
    for (_, frame) in &emissions {
        let (_, tpdu, apdu) = decode_tpdu(frame);
        assert_eq!(tpdu.kind, TpduKind::Ackd);
        assert_eq!(apdu, vec![0x30, 0xAA]);
    }

    assert_eq!(
        stack.next_event(),
        Some(AppEvent::Completion {
            tag: 9,
            success: false
        })
    );
    assert_eq!(stack.stats().transaction_timeouts, 1);
}

#[test]
fn the_final_retry_rides_the_alternate_path() {
    let mut stack = new_stack(3, 17);
    stack.send(ackd_request(2)).unwrap();

    let mut alt_flags = Vec::new();
    for t in [0u32, 96, 192, 288] {
        stack.service(Millis(t));
        let frame = stack.pop_npdu().unwrap();
        let (header, _, _) = decode_tpdu(&frame);
        alt_flags.push(header.alt_path);
    }
    assert_eq!(alt_flags, vec![false, false, false, true]);
}

#[test]
fn duplicate_acks_do_not_complete_twice() {
    let mut stack = new_stack(3, 17);
    stack.send(ackd_request(2)).unwrap();
    stack.service(Millis(0));
    let (_, tpdu, _) = decode_tpdu(&stack.pop_npdu().unwrap());

    for t in [10u32, 20, 30] {
        stack
            .push_npdu(ack_from(
                SubnetNode::new(1, 2),
                SubnetNode::new(3, 17),
                tpdu.tid,
            ))
            .unwrap();
        stack.service(Millis(t));
    }

    assert_eq!(
        stack.next_event(),
        Some(AppEvent::Completion {
            tag: 9,
            success: true
        })
    );
    assert_eq!(stack.next_event(), None);
    // Late acks after termination are counted, not processed.
    assert_eq!(stack.stats().late_acks, 2);
}

#[test]
fn broadcast_completes_on_first_ack() {
    let mut stack = new_stack(3, 17);
    stack
        .send(SendRequest {
            tag: 4,
            service: ServiceType::Acked,
            dest: Destination::Broadcast { subnet: 1 },
            retries: 3,
            tx_timer_ms: 96,
            apdu: lon_proto::Apdu::from_slice(&[0x51]).unwrap(),
            ..SendRequest::default()
        })
        .unwrap();
    stack.service(Millis(0));
    let (header, tpdu, _) = decode_tpdu(&stack.pop_npdu().unwrap());
    assert_eq!(header.dest, Destination::Broadcast { subnet: 1 });
    // Broadcasts advertise the configured backlog estimate.
    assert_eq!(header.delta_backlog, 15);

    stack
        .push_npdu(ack_from(
            SubnetNode::new(1, 7),
            SubnetNode::new(3, 17),
            tpdu.tid,
        ))
        .unwrap();
    stack.service(Millis(10));
    assert_eq!(
        stack.next_event(),
        Some(AppEvent::Completion {
            tag: 4,
            success: true
        })
    );
}

#[test]
fn enhanced_mode_carries_twelve_bit_tids_end_to_end() {
    let cfg = StackConfig {
        reset_delay_ms: 0,
        version: PduVersion::Enhanced,
        ..StackConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(42);
    let mut stack = Stack::new(cfg, tables(3, 17), &mut rng, Millis(0)).unwrap();
    stack.send(ackd_request(2)).unwrap();
    stack.service(Millis(0));

    let frame = stack.pop_npdu().unwrap();
    let (header, body) = NpduHeader::decode(frame.as_slice()).unwrap();
    assert_eq!(header.version, PduVersion::Enhanced);
    let (tpdu, apdu) = TpduHeader::decode(body, PduVersion::Enhanced).unwrap();
    assert_eq!(apdu, &[0x30, 0xAA]);

    let ack_header = NpduHeader {
        priority: false,
        alt_path: false,
        delta_backlog: 0,
        version: PduVersion::Enhanced,
        pdu_type: PduType::Tpdu,
        source: SubnetNode::new(1, 2),
        dest: Destination::SubnetNode { subnet: 3, node: 17 },
        domain: DomainId::new(DOMAIN),
    };
    let mut enclosed = Vec::new();
    TpduHeader {
        auth: false,
        kind: TpduKind::Ack,
        tid: tpdu.tid,
    }
    .encode_into(PduVersion::Enhanced, &mut enclosed);
    assert_eq!(enclosed.len(), 2, "enhanced headers carry an extra TID byte");
    stack
        .push_npdu(lon_tsa::IncomingFrame::new(&ack_header.encode(&enclosed)).unwrap())
        .unwrap();
    stack.service(Millis(10));
    assert_eq!(
        stack.next_event(),
        Some(AppEvent::Completion {
            tag: 9,
            success: true
        })
    );
}

#[test]
fn repeated_service_is_unconditionally_successful() {
    let mut stack = new_stack(3, 17);
    stack
        .send(SendRequest {
            tag: 5,
            service: ServiceType::Repeated,
            dest: Destination::SubnetNode { subnet: 1, node: 2 },
            retries: 2,
            tx_timer_ms: 48,
            apdu: lon_proto::Apdu::from_slice(&[0x60, 0x01]).unwrap(),
            ..SendRequest::default()
        })
        .unwrap();

    let mut backlogs = Vec::new();
    for t in [0u32, 48, 96, 144, 192] {
        stack.service(Millis(t));
        while let Some(frame) = stack.pop_npdu() {
            let (header, tpdu, _) = decode_tpdu(&frame);
            assert_eq!(tpdu.kind, TpduKind::UnackdRpt);
            backlogs.push(header.delta_backlog);
        }
    }
    // Repeated frames advertise the repeats still budgeted at emission
    // time: the budget is spent after the frame goes out.
    assert_eq!(backlogs, vec![2, 2, 1], "initial + 2 repeats");
    assert_eq!(
        stack.next_event(),
        Some(AppEvent::Completion {
            tag: 5,
            success: true
        })
    );
    assert_eq!(stack.stats().transaction_timeouts, 0);
}
