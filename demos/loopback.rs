use std::net::Ipv4Addr;

use ibverbs_model::packet::{self, UdpFrame};
use ibverbs_model::scenario::{Fabric, RawPacketEndpoint};
use ibverbs_model::{RecvWr, SendFlags, SendWr, WrList, DEFAULT_ACCESS_FLAGS};

fn main() {
    env_logger::init();

    let group = Ipv4Addr::new(239, 1, 2, 3);
    let mut tx = ibverbs_model::devices().open_first().unwrap();
    let mut rx = ibverbs_model::devices().open_first().unwrap();

    let sender = RawPacketEndpoint::create(&mut tx, None, 16).unwrap();
    let receiver = RawPacketEndpoint::create(&mut rx, None, 16).unwrap();
    rx.attach_mcast(receiver.qp, packet::multicast_gid(group), 0)
        .unwrap();

    let frame = UdpFrame::multicast([0x02, 0, 0, 0, 0, 1], Ipv4Addr::new(10, 0, 0, 1), group)
        .ports(4791, 4791)
        .build(&[0x42; 16])
        .unwrap();
    let send_mr = tx.reg_mr(sender.pd, frame.len(), DEFAULT_ACCESS_FLAGS).unwrap();
    tx.mr_bytes_mut(send_mr).unwrap().copy_from_slice(&frame);
    let recv_mr = rx.reg_mr(receiver.pd, 2048, DEFAULT_ACCESS_FLAGS).unwrap();

    let recvs: WrList<RecvWr> = [RecvWr::new(2, vec![rx.mr_slice(recv_mr, ..).unwrap()])]
        .into_iter()
        .collect();
    rx.post_recv(receiver.qp, &recvs).unwrap();
    let sends: WrList<SendWr> = [SendWr::new(1, vec![tx.mr_slice(send_mr, ..).unwrap()])
        .with_flags(SendFlags::SIGNALED)]
    .into_iter()
    .collect();
    tx.post_send(sender.qp, &sends).unwrap();

    Fabric::new().forward(&mut tx, sender.qp, &mut rx).unwrap();

    let mut sent = false;
    let mut received = false;
    while !sent || !received {
        let completed = tx
            .poll_cq(sender.send_cq, 16)
            .unwrap()
            .into_iter()
            .chain(rx.poll_cq(receiver.recv_cq, 16).unwrap());
        for wc in completed {
            assert!(wc.is_valid(), "{:?}", wc.error());
            match wc.wr_id() {
                1 => {
                    assert!(!sent);
                    sent = true;
                    println!("sent");
                }
                2 => {
                    assert!(!received);
                    received = true;
                    let bytes = &rx.mr_bytes(recv_mr).unwrap()[..wc.byte_len as usize];
                    let parsed = packet::parse_frame(bytes).unwrap();
                    assert_eq!(parsed.payload, &[0x42; 16]);
                    println!("received");
                }
                _ => unreachable!(),
            }
        }
    }

    sender.teardown(&mut tx).unwrap();
    receiver.teardown(&mut rx).unwrap();
    tx.close().unwrap();
    rx.close().unwrap();
}
