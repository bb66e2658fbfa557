//! Multicast transactions: partial acks, M_LIST reminders, group
//! request/response, and the receiver side of group addressing.

use lon_proto::{
    Apdu, Destination, DomainId, NpduHeader, PduType, PduVersion, SpduHeader, SpduKind,
    SubnetNode, TpduHeader, TpduKind, TransId,
};
use lon_tsa::tables::{AuthKey, DomainEntry, GroupEntry, Tables};
use lon_tsa::{
    AppEvent, DomainRef, IncomingFrame, Millis, SendRequest, ServiceType, Stack, StackConfig,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

const DOMAIN: &[u8] = &[0x49];

fn new_stack(subnet: u8, node: u8, groups: Vec<GroupEntry>) -> Stack {
    let tables = Tables {
        domains: vec![DomainEntry {
            id: DomainId::new(DOMAIN),
            subnet,
            node,
            key: AuthKey::Std([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]),
        }],
        groups,
    };
    let cfg = StackConfig {
        reset_delay_ms: 0,
        ..StackConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(7);
    Stack::new(cfg, tables, &mut rng, Millis(0)).unwrap()
}

fn member_of(group: u8, member: u8, size: u8) -> Vec<GroupEntry> {
    vec![GroupEntry {
        domain_index: 0,
        group,
        member,
        size,
    }]
}

fn group_ack(peer: SubnetNode, us: SubnetNode, group: u8, member: u8, tid: TransId) -> IncomingFrame {
    let header = NpduHeader {
        priority: false,
        alt_path: false,
        delta_backlog: 0,
        version: PduVersion::Legacy,
        pdu_type: PduType::Tpdu,
        source: peer,
        dest: Destination::GroupAck {
            subnet: us.subnet,
            node: us.node,
            group,
            member,
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
    IncomingFrame::new(&header.encode(&enclosed)).unwrap()
}

fn group_response(
    peer: SubnetNode,
    us: SubnetNode,
    group: u8,
    member: u8,
    tid: TransId,
    payload: &[u8],
) -> IncomingFrame {
    let header = NpduHeader {
        priority: false,
        alt_path: false,
        delta_backlog: 0,
        version: PduVersion::Legacy,
        pdu_type: PduType::Spdu,
        source: peer,
        dest: Destination::GroupAck {
            subnet: us.subnet,
            node: us.node,
            group,
            member,
        },
        domain: DomainId::new(DOMAIN),
    };
    let mut enclosed = Vec::new();
    SpduHeader {
        auth: false,
        kind: SpduKind::Response,
        tid,
    }
    .encode_into(PduVersion::Legacy, &mut enclosed);
    enclosed.extend_from_slice(payload);
    IncomingFrame::new(&header.encode(&enclosed)).unwrap()
}

#[test]
fn partial_acks_then_rem_msg_reminder() {
    // Group 7, six nodes including us; five must acknowledge.
    let mut stack = new_stack(3, 17, member_of(7, 5, 6));
    stack
        .send(SendRequest {
            tag: 3,
            service: ServiceType::Acked,
            dest: Destination::Group { group: 7 },
            domain: DomainRef::Index(0),
            group_size: 6,
            retries: 3,
            tx_timer_ms: 96,
            apdu: Apdu::from_slice(&[0x21, 0x07]).unwrap(),
            ..SendRequest::default()
        })
        .unwrap();

    stack.service(Millis(0));
    let frame = stack.pop_npdu().unwrap();
    let (header, body) = NpduHeader::decode(frame.as_slice()).unwrap();
    let (tpdu, _) = TpduHeader::decode(body, header.version).unwrap();
    assert_eq!(tpdu.kind, TpduKind::Ackd);
    assert_eq!(header.dest, Destination::Group { group: 7 });
    // Multicasts advertise the outstanding destination count.
    assert_eq!(header.delta_backlog, 5);
    let tid = tpdu.tid;

    let us = SubnetNode::new(3, 17);
    stack
        .push_npdu(group_ack(SubnetNode::new(1, 10), us, 7, 0, tid))
        .unwrap();
    stack.service(Millis(10));
    stack
        .push_npdu(group_ack(SubnetNode::new(1, 12), us, 7, 2, tid))
        .unwrap();
    stack.service(Millis(20));
    assert!(stack.pop_npdu().is_none());

    // Every intermediate ack restarts the transmit timer.
    stack.service(Millis(20 + 96));
    let frame = stack.pop_npdu().expect("reminder retry");
    let (_, body) = NpduHeader::decode(frame.as_slice()).unwrap();
    let (tpdu, rest) = TpduHeader::decode(body, PduVersion::Legacy).unwrap();
    assert_eq!(tpdu.kind, TpduKind::RemMsg);
    // M_LIST: one byte, members 0 and 2 already acknowledged, then the
    // original APDU so missing members need no earlier frame.
    assert_eq!(rest, &[0x01, 0b0000_0101, 0x21, 0x07]);

    for (t, peer, member) in [
        (130u32, SubnetNode::new(1, 11), 1u8),
        (140, SubnetNode::new(1, 13), 3),
        (150, SubnetNode::new(1, 14), 4),
    ] {
        stack.push_npdu(group_ack(peer, us, 7, member, tid)).unwrap();
        stack.service(Millis(t));
    }

    assert_eq!(
        stack.next_event(),
        Some(AppEvent::Completion {
            tag: 3,
            success: true
        })
    );
}

#[test]
fn duplicate_member_acks_count_once() {
    let mut stack = new_stack(3, 17, member_of(7, 5, 6));
    stack
        .send(SendRequest {
            tag: 3,
            service: ServiceType::Acked,
            dest: Destination::Group { group: 7 },
            group_size: 6,
            retries: 3,
            tx_timer_ms: 96,
            apdu: Apdu::from_slice(&[0x21]).unwrap(),
            ..SendRequest::default()
        })
        .unwrap();
    stack.service(Millis(0));
    let frame = stack.pop_npdu().unwrap();
    let (_, body) = NpduHeader::decode(frame.as_slice()).unwrap();
    let (tpdu, _) = TpduHeader::decode(body, PduVersion::Legacy).unwrap();

    let us = SubnetNode::new(3, 17);
    for t in [10u32, 20, 30] {
        stack
            .push_npdu(group_ack(SubnetNode::new(1, 10), us, 7, 0, tpdu.tid))
            .unwrap();
        stack.service(Millis(t));
    }
    // One member acked three times; the transaction must still be open.
    assert_eq!(stack.next_event(), None);
}

#[test]
fn multicast_request_gathers_responses_in_arrival_order() {
    let mut stack = new_stack(3, 17, member_of(3, 2, 3));
    stack
        .send(SendRequest {
            tag: 8,
            service: ServiceType::Request,
            dest: Destination::Group { group: 3 },
            group_size: 3,
            retries: 3,
            tx_timer_ms: 96,
            apdu: Apdu::from_slice(&[0x40]).unwrap(),
            ..SendRequest::default()
        })
        .unwrap();
    stack.service(Millis(0));
    let frame = stack.pop_npdu().unwrap();
    let (header, body) = NpduHeader::decode(frame.as_slice()).unwrap();
    assert_eq!(header.pdu_type, PduType::Spdu);
    let (spdu, _) = SpduHeader::decode(body, PduVersion::Legacy).unwrap();
    assert_eq!(spdu.kind, SpduKind::Request);

    let us = SubnetNode::new(3, 17);
    stack
        .push_npdu(group_response(
            SubnetNode::new(1, 10),
            us,
            3,
            0,
            spdu.tid,
            &[0xC0, 0x01],
        ))
        .unwrap();
    stack.service(Millis(10));
    stack
        .push_npdu(group_response(
            SubnetNode::new(1, 11),
            us,
            3,
            1,
            spdu.tid,
            &[0xC0, 0x02],
        ))
        .unwrap();
    stack.service(Millis(20));

    assert_eq!(
        stack.next_event(),
        Some(AppEvent::Response {
            tag: 8,
            source: SubnetNode::new(1, 10),
            apdu: Apdu::from_slice(&[0xC0, 0x01]).unwrap()
        })
    );
    assert_eq!(
        stack.next_event(),
        Some(AppEvent::Response {
            tag: 8,
            source: SubnetNode::new(1, 11),
            apdu: Apdu::from_slice(&[0xC0, 0x02]).unwrap()
        })
    );
    assert_eq!(
        stack.next_event(),
        Some(AppEvent::Completion {
            tag: 8,
            success: true
        })
    );
    assert_eq!(stack.next_event(), None);
}

#[test]
fn broadcast_request_takes_the_first_n_responses() {
    let mut stack = new_stack(3, 17, vec![]);
    stack
        .send(SendRequest {
            tag: 6,
            service: ServiceType::Request,
            dest: Destination::Broadcast { subnet: 0 },
            max_responses: 2,
            retries: 3,
            tx_timer_ms: 96,
            apdu: Apdu::from_slice(&[0x40]).unwrap(),
            ..SendRequest::default()
        })
        .unwrap();
    stack.service(Millis(0));
    let frame = stack.pop_npdu().unwrap();
    let (_, body) = NpduHeader::decode(frame.as_slice()).unwrap();
    let (spdu, _) = SpduHeader::decode(body, PduVersion::Legacy).unwrap();

    let us = SubnetNode::new(3, 17);
    let unicast_response = |peer: SubnetNode, payload: &[u8]| {
        let header = NpduHeader {
            priority: false,
            alt_path: false,
            delta_backlog: 0,
            version: PduVersion::Legacy,
            pdu_type: PduType::Spdu,
            source: peer,
            dest: Destination::SubnetNode {
                subnet: us.subnet,
                node: us.node,
            },
            domain: DomainId::new(DOMAIN),
        };
        let mut enclosed = Vec::new();
        SpduHeader {
            auth: false,
            kind: SpduKind::Response,
            tid: spdu.tid,
        }
        .encode_into(PduVersion::Legacy, &mut enclosed);
        enclosed.extend_from_slice(payload);
        IncomingFrame::new(&header.encode(&enclosed)).unwrap()
    };

    for (t, node, payload) in [(10u32, 10u8, 0x01u8), (20, 11, 0x02), (30, 12, 0x03)] {
        stack
            .push_npdu(unicast_response(SubnetNode::new(1, node), &[0xC0, payload]))
            .unwrap();
        stack.service(Millis(t));
    }

    assert_eq!(
        stack.next_event(),
        Some(AppEvent::Response {
            tag: 6,
            source: SubnetNode::new(1, 10),
            apdu: Apdu::from_slice(&[0xC0, 0x01]).unwrap()
        })
    );
    assert_eq!(
        stack.next_event(),
        Some(AppEvent::Response {
            tag: 6,
            source: SubnetNode::new(1, 11),
            apdu: Apdu::from_slice(&[0xC0, 0x02]).unwrap()
        })
    );
    assert_eq!(
        stack.next_event(),
        Some(AppEvent::Completion {
            tag: 6,
            success: true
        })
    );
    // The third response arrived after first-2-wins termination.
    assert_eq!(stack.next_event(), None);
}

#[test]
fn group_member_acknowledges_with_its_member_index() {
    // We are member 4 of group 9.
    let mut stack = new_stack(1, 10, member_of(9, 4, 6));
    let origin = SubnetNode::new(3, 17);
    let header = NpduHeader {
        priority: false,
        alt_path: false,
        delta_backlog: 5,
        version: PduVersion::Legacy,
        pdu_type: PduType::Tpdu,
        source: origin,
        dest: Destination::Group { group: 9 },
        domain: DomainId::new(DOMAIN),
    };
    let mut enclosed = Vec::new();
    TpduHeader {
        auth: false,
        kind: TpduKind::Ackd,
        tid: TransId(4),
    }
    .encode_into(PduVersion::Legacy, &mut enclosed);
    enclosed.extend_from_slice(&[0x21, 0x07]);
    stack
        .push_npdu(IncomingFrame::new(&header.encode(&enclosed)).unwrap())
        .unwrap();
    stack.service(Millis(0));

    let delivery = stack.next_indication().expect("delivered");
    assert_eq!(delivery.service, ServiceType::Acked);
    assert_eq!(delivery.apdu.as_slice(), &[0x21, 0x07]);
    assert_eq!(delivery.source, origin);

    let ack = stack.pop_npdu().expect("ack");
    let (ack_header, ack_body) = NpduHeader::decode(ack.as_slice()).unwrap();
    let (ack_tpdu, _) = TpduHeader::decode(ack_body, PduVersion::Legacy).unwrap();
    assert_eq!(ack_tpdu.kind, TpduKind::Ack);
    assert_eq!(ack_tpdu.tid, TransId(4));
    assert_eq!(
        ack_header.dest,
        Destination::GroupAck {
            subnet: 3,
            node: 17,
            group: 9,
            member: 4
        }
    );
}

#[test]
fn non_member_delivers_but_never_acknowledges() {
    let mut stack = new_stack(1, 10, vec![]);
    let header = NpduHeader {
        priority: false,
        alt_path: false,
        delta_backlog: 5,
        version: PduVersion::Legacy,
        pdu_type: PduType::Tpdu,
        source: SubnetNode::new(3, 17),
        dest: Destination::Group { group: 9 },
        domain: DomainId::new(DOMAIN),
    };
    let mut enclosed = Vec::new();
    TpduHeader {
        auth: false,
        kind: TpduKind::Ackd,
        tid: TransId(4),
    }
    .encode_into(PduVersion::Legacy, &mut enclosed);
    enclosed.push(0x21);
    stack
        .push_npdu(IncomingFrame::new(&header.encode(&enclosed)).unwrap())
        .unwrap();
    stack.service(Millis(0));

    assert!(stack.next_indication().is_some());
    assert!(stack.pop_npdu().is_none());
}

#[test]
fn rem_msg_reaches_a_node_that_missed_the_original() {
    let mut stack = new_stack(1, 10, member_of(9, 4, 6));
    let header = NpduHeader {
        priority: false,
        alt_path: false,
        delta_backlog: 5,
        version: PduVersion::Legacy,
        pdu_type: PduType::Tpdu,
        source: SubnetNode::new(3, 17),
        dest: Destination::Group { group: 9 },
        domain: DomainId::new(DOMAIN),
    };
    let mut enclosed = Vec::new();
    TpduHeader {
        auth: false,
        kind: TpduKind::RemMsg,
        tid: TransId(4),
    }
    .encode_into(PduVersion::Legacy, &mut enclosed);
    // M_LIST says members 0 and 2 acked; we are member 4 and must act.
    enclosed.extend_from_slice(&[0x01, 0b0000_0101]);
    enclosed.extend_from_slice(&[0x21, 0x07]);
    stack
        .push_npdu(IncomingFrame::new(&header.encode(&enclosed)).unwrap())
        .unwrap();
    stack.service(Millis(0));

    let delivery = stack.next_indication().expect("REM_MSG self-contains the message");
    assert_eq!(delivery.apdu.as_slice(), &[0x21, 0x07]);
    assert!(stack.pop_npdu().is_some(), "and it gets acknowledged");

    // The same reminder again, now with our bit set: nothing more happens.
    let mut enclosed = Vec::new();
    TpduHeader {
        auth: false,
        kind: TpduKind::RemMsg,
        tid: TransId(4),
    }
    .encode_into(PduVersion::Legacy, &mut enclosed);
    enclosed.extend_from_slice(&[0x01, 0b0001_0101]);
    enclosed.extend_from_slice(&[0x21, 0x07]);
    stack
        .push_npdu(IncomingFrame::new(&header.encode(&enclosed)).unwrap())
        .unwrap();
    stack.service(Millis(10));
    assert!(stack.pop_npdu().is_none());
    assert!(stack.next_indication().is_none());
}

#[test]
fn bare_reminder_without_a_record_is_dropped() {
    let mut stack = new_stack(1, 10, member_of(9, 4, 6));
    let header = NpduHeader {
        priority: false,
        alt_path: false,
        delta_backlog: 0,
        version: PduVersion::Legacy,
        pdu_type: PduType::Tpdu,
        source: SubnetNode::new(3, 17),
        dest: Destination::Group { group: 9 },
        domain: DomainId::new(DOMAIN),
    };
    let mut enclosed = Vec::new();
    TpduHeader {
        auth: false,
        kind: TpduKind::Reminder,
        tid: TransId(4),
    }
    .encode_into(PduVersion::Legacy, &mut enclosed);
    enclosed.extend_from_slice(&[0x01, 0x00]);
    stack
        .push_npdu(IncomingFrame::new(&header.encode(&enclosed)).unwrap())
        .unwrap();
    stack.service(Millis(0));

    assert!(stack.next_indication().is_none());
    assert!(stack.pop_npdu().is_none());
}
