use std::net::Ipv4Addr;
use std::time::Duration;

use ibverbs_model::packet::{self, HEADERS_LEN};
use ibverbs_model::scenario::{
    destroy_after_unblocking, expect_completion, DestroyOutcome, ExpectedCompletion, Fabric,
    RawPacketEndpoint,
};
use ibverbs_model::{
    AccessFlags, Blocker, Delivery, Error, QpType, RecvWr, ResourceKind, SendFlags, SendWr,
    WaitPolicy, WcFlags, WcOpcode, WcStatus, WrList, DEFAULT_ACCESS_FLAGS, PORT_NUM,
};

#[test]
fn can_list_rdma_devices() {
    let device_list = ibverbs_model::devices();
    assert!(!device_list.is_empty());
}

#[test]
fn can_open_test_device() {
    let device_list = ibverbs_model::devices();
    let test_device = helper::test_device(&device_list).expect("Could not find RDMA test device");
    let mut ctx = test_device.open().expect("Could not open test device");
    ctx.close().expect("Could not close test device");
}

#[test]
fn test_device_can_open_then_close_then_open() {
    let device_list = ibverbs_model::devices();
    for _ in 0..2 {
        let test_device = helper::test_device(&device_list).expect("Could not find RDMA test device");
        let mut ctx = test_device.open().expect("Could not open test device");
        let pd = ctx.alloc_pd().expect("Could not allocate protection domain");
        ctx.dealloc_pd(pd).expect("Could not deallocate protection domain");
        ctx.close().expect("Could not close test device");
    }
}

#[test]
fn incorrect_destroy_seq() {
    let mut ctx = helper::open();
    let cc = ctx.create_comp_channel().expect("Could not create completion channel");
    let ep = helper::Endpoint::create(&mut ctx, Some(cc), 1);
    let gid = packet::multicast_gid(helper::GROUP);
    ctx.attach_mcast(ep.qp, gid, 0)
        .expect("Could not attach to multicast group");

    // qp still attached to a group
    let err = ctx.destroy_qp(ep.qp).unwrap_err();
    assert!(err.is_busy());
    assert_eq!(err.errno(), nix::errno::Errno::EBUSY);
    assert!(ctx.is_live(ep.qp));
    // the refused destroy left the qp usable
    assert!(matches!(
        helper::receive(&mut ctx, &ep, 1, b"still here"),
        Delivery::Completed { .. }
    ));
    assert_eq!(ctx.poll_cq(ep.cq, 4).unwrap().len(), 1);

    // cq still used by the qp, pd still owning the qp and the mr
    assert!(ctx.destroy_cq(ep.cq).unwrap_err().is_busy());
    assert!(ctx.dealloc_pd(ep.pd).unwrap_err().is_busy());
    // channel still bound to the cq
    assert!(ctx.destroy_comp_channel(cc).unwrap_err().is_busy());

    let outcome = destroy_after_unblocking(&mut ctx, ep.qp, |ctx| ctx.detach_mcast(ep.qp, gid))
        .expect("Could not destroy queue pair");
    assert_eq!(
        outcome,
        DestroyOutcome::DestroyedAfterUnblocking(Blocker::Resource(
            ResourceKind::MulticastMembership
        ))
    );

    let outcome = destroy_after_unblocking(&mut ctx, ep.pd, |ctx| ctx.dereg_mr(ep.mr))
        .expect("Could not deallocate protection domain");
    assert_eq!(
        outcome,
        DestroyOutcome::DestroyedAfterUnblocking(Blocker::Resource(ResourceKind::MemoryRegion))
    );

    let outcome = destroy_after_unblocking(&mut ctx, cc, |ctx| ctx.destroy_cq(ep.cq))
        .expect("Could not destroy completion channel");
    assert_eq!(
        outcome,
        DestroyOutcome::DestroyedAfterUnblocking(Blocker::Resource(
            ResourceKind::CompletionQueue
        ))
    );

    ctx.close().expect("Could not close context");
}

#[test]
fn incorrect_destroy_seq_pd_with_qp() {
    let mut ctx = helper::open();
    let pd = ctx.alloc_pd().unwrap();
    let cq = ctx.create_cq(4, 0, None, 0).unwrap();
    let qp = ctx
        .create_qp(pd, cq, cq, QpType::RawPacket)
        .build()
        .expect("Could not create queue pair");

    match ctx.dealloc_pd(pd) {
        Err(Error::ResourceBusy { target, blocker }) => {
            assert_eq!(target, ResourceKind::ProtectionDomain);
            assert_eq!(blocker, Blocker::Resource(ResourceKind::QueuePair));
        }
        other => panic!("dealloc_pd returned {:?}", other),
    }
    let outcome = destroy_after_unblocking(&mut ctx, pd, |ctx| ctx.destroy_qp(qp)).unwrap();
    assert!(matches!(outcome, DestroyOutcome::DestroyedAfterUnblocking(_)));
    ctx.destroy_cq(cq).unwrap();
    ctx.close().unwrap();
}

#[test]
fn bad_cq_pool_size() {
    let mut ctx = helper::open();
    let attr = ctx.query_device().unwrap();
    for cqe in [-1, 0, attr.max_cqe as i32 + 1] {
        assert!(
            matches!(ctx.create_cq(cqe, 0, None, 0), Err(Error::InvalidArgument(_))),
            "cqe {} accepted",
            cqe
        );
    }

    let pool = attr.pool_size();
    let cq = ctx
        .create_cq(pool as i32, 0, None, 0)
        .expect("Could not create completion queue");
    let pd = ctx.alloc_pd().unwrap();
    let err = ctx
        .create_qp(pd, cq, cq, QpType::RawPacket)
        .set_max_recv_wr(attr.max_qp_wr + 1)
        .build()
        .unwrap_err();
    assert_eq!(err.errno(), nix::errno::Errno::EINVAL);
    let qp = ctx
        .create_qp(pd, cq, cq, QpType::RawPacket)
        .set_max_send_wr(pool)
        .set_max_recv_wr(pool)
        .build()
        .expect("Could not create queue pair");

    ctx.destroy_qp(qp).unwrap();
    ctx.destroy_cq(cq).unwrap();
    ctx.dealloc_pd(pd).unwrap();
    ctx.close().unwrap();
}

#[test]
fn bad_qp_type() {
    let mut ctx = helper::open();
    let pd = ctx.alloc_pd().unwrap();
    let cq = ctx.create_cq(4, 0, None, 0).unwrap();
    for raw in [0u32, 1, 5, 7, 9, 0xff, u32::MAX] {
        assert!(
            matches!(
                ctx.create_qp(pd, cq, cq, raw).build(),
                Err(Error::InvalidArgument(_))
            ),
            "qp type {} accepted",
            raw
        );
    }
    // nothing was created by the failed attempts
    ctx.destroy_cq(cq).unwrap();
    let cq = ctx.create_cq(4, 0, None, 0).unwrap();

    let qp = ctx
        .create_qp(pd, cq, cq, QpType::RawPacket)
        .build()
        .expect("Could not create raw packet queue pair");
    assert_eq!(ctx.qp(qp).unwrap().qp_type(), QpType::RawPacket);
    ctx.destroy_qp(qp).unwrap();
    ctx.destroy_cq(cq).unwrap();
    ctx.dealloc_pd(pd).unwrap();
    ctx.close().unwrap();
}

#[test]
fn create_cq_bad_comp_vect() {
    let mut ctx = helper::open();
    let n = ctx.query_device().unwrap().num_comp_vectors as i32;
    let cc = ctx.create_comp_channel().unwrap();
    for vector in [-1, n, n + 1, i32::MIN] {
        assert!(
            matches!(ctx.create_cq(4, 0, Some(cc), vector), Err(Error::InvalidArgument(_))),
            "completion vector {} accepted",
            vector
        );
    }
    assert!(ctx.comp_channel(cc).unwrap().subscribers().is_empty());

    let cq = ctx
        .create_cq(4, 0, Some(cc), n - 1)
        .expect("Could not create completion queue on the last vector");
    assert_eq!(ctx.cq(cq).unwrap().comp_vector(), (n - 1) as u32);
    ctx.destroy_cq(cq).unwrap();
    ctx.destroy_comp_channel(cc).unwrap();
    ctx.close().unwrap();
}

#[test]
fn circle_wr() {
    let _ = env_logger::try_init();
    let mut ctx = helper::open();
    let ep = helper::Endpoint::create(&mut ctx, None, 8);
    let len = ctx.mr(ep.mr).unwrap().len();

    for n in 2..=8usize {
        for back_to in [0, n / 2, n - 1] {
            let mut sends: WrList<SendWr> = (0..n)
                .map(|i| {
                    let sge = ctx.mr_slice(ep.mr, ..len).unwrap();
                    SendWr::new(i as u64, vec![sge]).with_flags(SendFlags::SIGNALED)
                })
                .collect();
            sends.set_next(n - 1, Some(back_to)).unwrap();
            let err = ctx.post_send(ep.qp, &sends).unwrap_err();
            assert_eq!(err.posted, 0);
            assert_eq!(err.bad_wr, Some(back_to));
            assert!(matches!(err.error, Error::CycleDetected { bad_wr } if bad_wr == back_to));
            assert_eq!(err.errno(), nix::errno::Errno::EINVAL);

            let mut recvs: WrList<RecvWr> = (0..n)
                .map(|i| RecvWr::new(i as u64, vec![ctx.mr_slice(ep.mr, ..).unwrap()]))
                .collect();
            recvs.set_next(n - 1, Some(back_to)).unwrap();
            let err = ctx.post_recv(ep.qp, &recvs).unwrap_err();
            assert_eq!(err.posted, 0);
            assert_eq!(err.bad_wr, Some(back_to));
        }
    }

    // no partial progress
    assert!(ctx.poll_cq(ep.cq, 16).unwrap().is_empty());
    assert!(ctx.take_transmitted(ep.qp).unwrap().is_empty());
    assert_eq!(ctx.qp(ep.qp).unwrap().outstanding_recvs(), 0);

    ep.teardown(&mut ctx);
    ctx.close().unwrap();
}

#[test]
fn cq_context_two_cc() {
    let mut ctx = helper::open();
    let cc_a = ctx.create_comp_channel().unwrap();
    let cc_b = ctx.create_comp_channel().unwrap();
    let a = helper::Endpoint::create_with_context(&mut ctx, Some(cc_a), 4, 0xaaaa);
    let b = helper::Endpoint::create_with_context(&mut ctx, Some(cc_b), 4, 0xbbbb);
    ctx.req_notify_cq(a.cq, false).unwrap();
    ctx.req_notify_cq(b.cq, false).unwrap();

    helper::receive(&mut ctx, &b, 2, b"to b");
    helper::receive(&mut ctx, &a, 1, b"to a");

    assert_eq!(
        ctx.get_cq_event(cc_a, WaitPolicy::NoWait).unwrap(),
        (a.cq, 0xaaaa)
    );
    assert_eq!(
        ctx.get_cq_event(cc_b, WaitPolicy::NoWait).unwrap(),
        (b.cq, 0xbbbb)
    );
    assert!(matches!(
        ctx.get_cq_event(cc_a, WaitPolicy::NoWait),
        Err(Error::WouldBlock)
    ));
    ctx.ack_cq_events(a.cq, 1).unwrap();
    ctx.ack_cq_events(b.cq, 1).unwrap();

    a.teardown(&mut ctx);
    b.teardown(&mut ctx);
    ctx.destroy_comp_channel(cc_a).unwrap();
    ctx.destroy_comp_channel(cc_b).unwrap();
    ctx.close().unwrap();
}

#[test]
fn cq_context_two_cq() {
    let mut ctx = helper::open();
    let cc = ctx.create_comp_channel().unwrap();
    let a = helper::Endpoint::create_with_context(&mut ctx, Some(cc), 4, 0x1111);
    let b = helper::Endpoint::create_with_context(&mut ctx, Some(cc), 4, 0x2222);
    ctx.req_notify_cq(a.cq, false).unwrap();
    ctx.req_notify_cq(b.cq, false).unwrap();

    helper::receive(&mut ctx, &a, 1, b"first");
    helper::receive(&mut ctx, &b, 2, b"second");
    assert_eq!(ctx.comp_channel(cc).unwrap().pending_events(), 2);

    let first = ctx
        .get_cq_event(cc, WaitPolicy::Timeout(Duration::from_millis(100)))
        .unwrap();
    let second = ctx
        .get_cq_event(cc, WaitPolicy::Timeout(Duration::from_millis(100)))
        .unwrap();
    assert_eq!(first, (a.cq, 0x1111));
    assert_eq!(second, (b.cq, 0x2222));

    // the queue pair keeps the cq alive
    assert_eq!(
        ctx.destroy_cq(a.cq).unwrap_err().to_string(),
        "cannot destroy completion queue: a live queue pair still depends on it"
    );
    ctx.ack_cq_events(a.cq, 1).unwrap();
    ctx.ack_cq_events(b.cq, 1).unwrap();
    assert!(ctx.ack_cq_events(b.cq, 1).is_err());

    a.teardown(&mut ctx);
    b.teardown(&mut ctx);
    ctx.destroy_comp_channel(cc).unwrap();
    ctx.close().unwrap();
}

#[test]
fn cq_context_unacked_events_block_destroy() {
    let mut ctx = helper::open();
    let cc = ctx.create_comp_channel().unwrap();
    let cq = ctx.create_cq(4, 7, Some(cc), 0).unwrap();
    let pd = ctx.alloc_pd().unwrap();
    let mr = ctx.reg_mr(pd, 256, DEFAULT_ACCESS_FLAGS).unwrap();
    let qp = ctx
        .create_qp(pd, cq, cq, QpType::RawPacket)
        .build()
        .unwrap();
    ctx.ready(qp, PORT_NUM).unwrap();
    ctx.req_notify_cq(cq, false).unwrap();
    let recvs: WrList<RecvWr> = [RecvWr::new(1, vec![ctx.mr_slice(mr, ..).unwrap()])]
        .into_iter()
        .collect();
    ctx.post_recv(qp, &recvs).unwrap();
    ctx.deliver(qp, &helper::frame(0, b"x")).unwrap();
    assert_eq!(ctx.get_cq_event(cc, WaitPolicy::NoWait).unwrap(), (cq, 7));

    ctx.destroy_qp(qp).unwrap();
    match ctx.destroy_cq(cq) {
        Err(Error::ResourceBusy { blocker, .. }) => {
            assert_eq!(blocker, Blocker::UnackedEvents(1));
        }
        other => panic!("destroy_cq returned {:?}", other),
    }
    let outcome = destroy_after_unblocking(&mut ctx, cq, |ctx| ctx.ack_cq_events(cq, 1)).unwrap();
    assert_eq!(outcome, DestroyOutcome::DestroyedAfterUnblocking(Blocker::UnackedEvents(1)));

    ctx.dereg_mr(mr).unwrap();
    ctx.dealloc_pd(pd).unwrap();
    ctx.destroy_comp_channel(cc).unwrap();
    ctx.close().unwrap();
}

#[test]
fn cq_context_two_notify_calls() {
    let mut ctx = helper::open();
    let cc = ctx.create_comp_channel().unwrap();
    let ep = helper::Endpoint::create_with_context(&mut ctx, Some(cc), 4, 42);
    ctx.req_notify_cq(ep.cq, false).unwrap();
    ctx.req_notify_cq(ep.cq, false).unwrap();

    helper::receive(&mut ctx, &ep, 1, b"one");
    helper::receive(&mut ctx, &ep, 2, b"two");

    assert_eq!(ctx.get_cq_event(cc, WaitPolicy::NoWait).unwrap(), (ep.cq, 42));
    assert!(matches!(
        ctx.get_cq_event(cc, WaitPolicy::Timeout(Duration::from_millis(10))),
        Err(Error::TimedOut)
    ));
    assert_eq!(ctx.poll_cq(ep.cq, 4).unwrap().len(), 2);

    // re-arming generates the next event
    ctx.req_notify_cq(ep.cq, false).unwrap();
    helper::receive(&mut ctx, &ep, 3, b"three");
    assert_eq!(ctx.get_cq_event(cc, WaitPolicy::NoWait).unwrap(), (ep.cq, 42));
    ctx.ack_cq_events(ep.cq, 2).unwrap();

    ep.teardown(&mut ctx);
    ctx.destroy_comp_channel(cc).unwrap();
    ctx.close().unwrap();
}

#[test]
fn cq_context_two_contexts() {
    let mut first = helper::open();
    let mut second = helper::open();
    let cc_1 = first.create_comp_channel().unwrap();
    let cc_2 = second.create_comp_channel().unwrap();
    let ep_1 = helper::Endpoint::create_with_context(&mut first, Some(cc_1), 4, 1);
    let ep_2 = helper::Endpoint::create_with_context(&mut second, Some(cc_2), 4, 2);
    first.req_notify_cq(ep_1.cq, false).unwrap();
    second.req_notify_cq(ep_2.cq, false).unwrap();

    helper::receive(&mut first, &ep_1, 1, b"first");
    assert!(!helper::fd_ready(&second, cc_2));
    helper::receive(&mut second, &ep_2, 1, b"second");

    assert_eq!(first.get_cq_event(cc_1, WaitPolicy::NoWait).unwrap(), (ep_1.cq, 1));
    assert_eq!(second.get_cq_event(cc_2, WaitPolicy::NoWait).unwrap(), (ep_2.cq, 2));

    // handles do not cross contexts
    assert!(matches!(
        first.cq(ep_2.cq),
        Err(Error::StaleHandle(ResourceKind::CompletionQueue))
    ));

    first.ack_cq_events(ep_1.cq, 1).unwrap();
    second.ack_cq_events(ep_2.cq, 1).unwrap();
    ep_1.teardown(&mut first);
    ep_2.teardown(&mut second);
    first.destroy_comp_channel(cc_1).unwrap();
    second.destroy_comp_channel(cc_2).unwrap();
    first.close().unwrap();
    second.close().unwrap();
}

#[test]
fn armed_and_unarmed_cq_on_one_channel() {
    let mut ctx = helper::open();
    let cc = ctx.create_comp_channel().unwrap();
    let armed = helper::Endpoint::create_with_context(&mut ctx, Some(cc), 4, 10);
    let unarmed = helper::Endpoint::create_with_context(&mut ctx, Some(cc), 4, 20);
    ctx.req_notify_cq(armed.cq, false).unwrap();

    helper::receive(&mut ctx, &unarmed, 1, b"quiet");
    assert!(!helper::fd_ready(&ctx, cc));
    helper::receive(&mut ctx, &armed, 2, b"loud");
    assert!(helper::fd_ready(&ctx, cc));

    assert_eq!(ctx.get_cq_event(cc, WaitPolicy::NoWait).unwrap(), (armed.cq, 10));
    assert!(matches!(
        ctx.get_cq_event(cc, WaitPolicy::NoWait),
        Err(Error::WouldBlock)
    ));
    assert!(!helper::fd_ready(&ctx, cc));

    // the unarmed cq still has its completion
    let wcs = ctx.poll_cq(unarmed.cq, 4).unwrap();
    assert_eq!(wcs.len(), 1);
    assert_eq!(wcs[0].wr_id(), 1);
    assert!(wcs[0].is_valid());

    ctx.ack_cq_events(armed.cq, 1).unwrap();
    armed.teardown(&mut ctx);
    unarmed.teardown(&mut ctx);
    ctx.destroy_comp_channel(cc).unwrap();
    ctx.close().unwrap();
}

#[test]
fn solicited_only_notification() {
    let mut ctx = helper::open();
    let cc = ctx.create_comp_channel().unwrap();
    let ep = helper::Endpoint::create_with_context(&mut ctx, Some(cc), 4, 5);
    ctx.req_notify_cq(ep.cq, true).unwrap();

    helper::receive(&mut ctx, &ep, 1, b"unsolicited");
    assert!(!helper::fd_ready(&ctx, cc));

    let frame = helper::frame(1, b"solicited");
    helper::post_recv(&mut ctx, &ep, 2);
    let packet = ibverbs_model::Packet {
        data: &frame,
        imm_data: None,
        solicited: true,
    };
    ctx.deliver_packet(ep.qp, packet).unwrap();
    assert_eq!(ctx.get_cq_event(cc, WaitPolicy::NoWait).unwrap(), (ep.cq, 5));
    ctx.ack_cq_events(ep.cq, 1).unwrap();

    ep.teardown(&mut ctx);
    ctx.destroy_comp_channel(cc).unwrap();
    ctx.close().unwrap();
}

#[test]
fn wc_fields() {
    let _ = env_logger::try_init();
    let payload = [0x5a; helper::PAYLOAD_LEN];
    let mut tx = helper::open();
    let mut rx = helper::open();
    let sender = RawPacketEndpoint::create(&mut tx, None, 4).unwrap();
    let receiver = RawPacketEndpoint::create(&mut rx, None, 4).unwrap();
    rx.attach_mcast(receiver.qp, packet::multicast_gid(helper::GROUP), 0)
        .unwrap();

    let frame = helper::frame(9, &payload);
    let send_mr = tx.reg_mr(sender.pd, frame.len(), DEFAULT_ACCESS_FLAGS).unwrap();
    tx.mr_bytes_mut(send_mr).unwrap().copy_from_slice(&frame);
    let recv_mr = rx.reg_mr(receiver.pd, 2048, DEFAULT_ACCESS_FLAGS).unwrap();

    let recvs: WrList<RecvWr> = [RecvWr::new(100, vec![rx.mr_slice(recv_mr, ..).unwrap()])]
        .into_iter()
        .collect();
    rx.post_recv(receiver.qp, &recvs).unwrap();
    let sends: WrList<SendWr> = [SendWr::new(200, vec![tx.mr_slice(send_mr, ..).unwrap()])
        .with_flags(SendFlags::SIGNALED)]
    .into_iter()
    .collect();
    assert_eq!(tx.post_send(sender.qp, &sends).unwrap(), 1);

    let mut fabric = Fabric::new();
    assert_eq!(fabric.forward(&mut tx, sender.qp, &mut rx).unwrap(), 1);

    let send_wcs = tx.poll_cq(sender.send_cq, 4).unwrap();
    assert_eq!(send_wcs.len(), 1);
    let tx_qp_num = tx.qp(sender.qp).unwrap().qp_num();
    assert_eq!(
        expect_completion(&send_wcs[0], &ExpectedCompletion::send(200, tx_qp_num)),
        vec![]
    );

    let recv_wcs = rx.poll_cq(receiver.recv_cq, 4).unwrap();
    assert_eq!(recv_wcs.len(), 1);
    let wc = recv_wcs[0];
    let rx_qp_num = rx.qp(receiver.qp).unwrap().qp_num();
    let expected =
        ExpectedCompletion::recv(100, rx_qp_num, (helper::PAYLOAD_LEN + HEADERS_LEN) as u32);
    assert_eq!(expect_completion(&wc, &expected), vec![]);
    assert_eq!(wc.opcode, WcOpcode::Recv);
    assert!(wc.wc_flags.contains(WcFlags::GRH));
    assert_eq!((wc.sl, wc.dlid_path_bits, wc.vendor_err, wc.imm_data), (0, 0, 0, 0));

    let received = rx.mr_bytes(recv_mr).unwrap();
    let parsed = packet::parse_frame(&received[..frame.len()]).unwrap();
    assert_eq!(parsed.payload, &payload[..]);
    assert_eq!(parsed.header.seq, 9);

    sender.teardown(&mut tx).unwrap();
    receiver.teardown(&mut rx).unwrap();
    tx.close().unwrap();
    rx.close().unwrap();
}

#[test]
fn wc_fields_two_qps_one_cq() {
    for send_first in [true, false] {
        let mut ctx = helper::open();
        let pd = ctx.alloc_pd().unwrap();
        let cq = ctx.create_cq(16, 0, None, 0).unwrap();
        let mut qps = Vec::new();
        for _ in 0..2 {
            let qp = ctx
                .create_qp(pd, cq, cq, QpType::RawPacket)
                .set_max_send_wr(4)
                .set_max_recv_wr(4)
                .build()
                .unwrap();
            ctx.ready(qp, PORT_NUM).unwrap();
            qps.push(qp);
        }
        let (recv_qp, send_qp) = (qps[0], qps[1]);
        let recv_qp_num = ctx.qp(recv_qp).unwrap().qp_num();
        let send_qp_num = ctx.qp(send_qp).unwrap().qp_num();

        let frame = helper::frame(1, &[0x3c; helper::PAYLOAD_LEN]);
        let send_mr = ctx.register(pd, frame.clone(), DEFAULT_ACCESS_FLAGS).unwrap();
        let recv_mr = ctx.reg_mr(pd, 2048, DEFAULT_ACCESS_FLAGS).unwrap();
        let recv_sge = ctx.mr_slice(recv_mr, ..).unwrap();
        let send_sge = ctx.mr_slice(send_mr, ..).unwrap();

        // two rounds, so completions of both queue pairs interleave on the cq
        let mut expected = Vec::new();
        for round in 0..2u64 {
            let recvs: WrList<RecvWr> = [RecvWr::new(10 + round, vec![recv_sge])]
                .into_iter()
                .collect();
            ctx.post_recv(recv_qp, &recvs).unwrap();
            let sends: WrList<SendWr> = [SendWr::new(20 + round, vec![send_sge])
                .with_flags(SendFlags::SIGNALED)]
            .into_iter()
            .collect();
            let send = ExpectedCompletion::send(20 + round, send_qp_num);
            let recv = ExpectedCompletion::recv(10 + round, recv_qp_num, frame.len() as u32);

            if send_first {
                ctx.post_send(send_qp, &sends).unwrap();
                for out in ctx.take_transmitted(send_qp).unwrap() {
                    ctx.deliver_packet(recv_qp, out.as_packet()).unwrap();
                }
                expected.extend([send, recv]);
            } else {
                ctx.deliver(recv_qp, &frame).unwrap();
                ctx.post_send(send_qp, &sends).unwrap();
                assert_eq!(ctx.take_transmitted(send_qp).unwrap().len(), 1);
                expected.extend([recv, send]);
            }
        }

        let wcs = ctx.poll_cq(cq, 16).unwrap();
        assert_eq!(wcs.len(), expected.len(), "send_first = {}", send_first);
        for (wc, expected) in wcs.iter().zip(&expected) {
            assert_eq!(
                expect_completion(wc, expected),
                vec![],
                "send_first = {}",
                send_first
            );
            match wc.opcode {
                WcOpcode::Send => {
                    assert_eq!(wc.qp_num, send_qp_num);
                    assert_eq!(wc.byte_len, 0);
                    assert!(wc.wc_flags.is_empty());
                }
                WcOpcode::Recv => {
                    assert_eq!(wc.qp_num, recv_qp_num);
                    assert_eq!(wc.byte_len as usize, frame.len());
                    assert_eq!(wc.wc_flags, WcFlags::GRH);
                }
            }
        }
        assert_eq!(&ctx.mr_bytes(recv_mr).unwrap()[..frame.len()], &frame[..]);
        assert!(ctx.poll_cq(cq, 16).unwrap().is_empty());

        for qp in qps {
            ctx.destroy_qp(qp).unwrap();
        }
        ctx.destroy_cq(cq).unwrap();
        ctx.dereg_mr(send_mr).unwrap();
        ctx.dereg_mr(recv_mr).unwrap();
        ctx.dealloc_pd(pd).unwrap();
        ctx.close().unwrap();
    }
}

#[test]
fn many_wrs() {
    let _ = env_logger::try_init();
    let mut ctx = helper::open();
    let pd = ctx.alloc_pd().unwrap();
    let cq = ctx.create_cq(16, 0, None, 0).unwrap();
    let qp = ctx
        .create_qp(pd, cq, cq, QpType::RawPacket)
        .set_max_send_wr(8)
        .set_max_send_sge(2)
        .set_max_inline_data(64)
        .build()
        .unwrap();
    ctx.ready(qp, PORT_NUM).unwrap();

    let payload = [0x11; helper::PAYLOAD_LEN];
    let frame = packet::UdpFrame::multicast(helper::SRC_MAC, helper::SRC_IP, helper::GROUP)
        .ports(helper::PORT, helper::PORT)
        .build_without_checksum(&payload)
        .unwrap();
    let mr = ctx.reg_mr(pd, frame.len(), DEFAULT_ACCESS_FLAGS).unwrap();
    ctx.mr_bytes_mut(mr).unwrap().copy_from_slice(&frame);

    // headers and payload in separate scatter/gather entries
    let sends: WrList<SendWr> = (0..8u64)
        .map(|i| {
            let sg_list = vec![
                ctx.mr_slice(mr, ..HEADERS_LEN).unwrap(),
                ctx.mr_slice(mr, HEADERS_LEN..).unwrap(),
            ];
            let mut flags = SendFlags::IP_CSUM;
            if i % 2 == 0 {
                flags |= SendFlags::SIGNALED;
            }
            SendWr::new(i, sg_list).with_flags(flags)
        })
        .collect();
    assert_eq!(ctx.post_send(qp, &sends).unwrap(), 8);

    let wcs = ctx.poll_cq(cq, 16).unwrap();
    let qp_num = ctx.qp(qp).unwrap().qp_num();
    assert_eq!(wcs.len(), 4);
    for (wc, wr_id) in wcs.iter().zip([0, 2, 4, 6]) {
        assert_eq!(expect_completion(wc, &ExpectedCompletion::send(wr_id, qp_num)), vec![]);
    }

    let transmitted = ctx.take_transmitted(qp).unwrap();
    assert_eq!(transmitted.len(), 8);
    for out in &transmitted {
        let parsed = packet::parse_frame(&out.data).unwrap();
        assert_ne!(parsed.ip_checksum, 0);
        assert!(parsed.checksum_valid());
        assert_eq!(parsed.payload, &payload[..]);
    }

    // without checksum offload the frame leaves as it was written
    let sends: WrList<SendWr> = [SendWr::new(8, vec![ctx.mr_slice(mr, ..).unwrap()])]
        .into_iter()
        .collect();
    ctx.post_send(qp, &sends).unwrap();
    let out = ctx.take_transmitted(qp).unwrap();
    assert_eq!(packet::parse_frame(&out[0].data).unwrap().ip_checksum, 0);
    assert_eq!(out[0].data, frame);

    // the second request is too large to be inlined
    let sends: WrList<SendWr> = [
        SendWr::new(9, vec![ctx.mr_slice(mr, ..32).unwrap()]).with_flags(SendFlags::INLINE),
        SendWr::new(10, vec![ctx.mr_slice(mr, ..).unwrap()]).with_flags(SendFlags::INLINE),
    ]
    .into_iter()
    .collect();
    let err = ctx.post_send(qp, &sends).unwrap_err();
    assert_eq!((err.posted, err.bad_wr), (1, Some(1)));
    assert!(matches!(err.error, Error::InvalidArgument(_)));
    assert_eq!(ctx.take_transmitted(qp).unwrap().len(), 1);

    // longer than the send queue: nothing is posted
    let sends: WrList<SendWr> = (0..9u64)
        .map(|i| SendWr::new(i, vec![ctx.mr_slice(mr, ..).unwrap()]))
        .collect();
    let err = ctx.post_send(qp, &sends).unwrap_err();
    assert_eq!(err.posted, 0);
    assert!(matches!(
        err.error,
        Error::QueueOverflow {
            requested: 9,
            available: 8
        }
    ));
    assert!(ctx.take_transmitted(qp).unwrap().is_empty());

    ctx.destroy_qp(qp).unwrap();
    ctx.destroy_cq(cq).unwrap();
    ctx.dereg_mr(mr).unwrap();
    ctx.dealloc_pd(pd).unwrap();
    ctx.close().unwrap();
}

#[test]
fn many_wrs_sig_all() {
    let mut ctx = helper::open();
    let cc = ctx.create_comp_channel().unwrap();
    let pd = ctx.alloc_pd().unwrap();
    let cq = ctx.create_cq(16, 0, Some(cc), 0).unwrap();
    let qp = ctx
        .create_qp(pd, cq, cq, QpType::RawPacket)
        .set_max_send_wr(8)
        .set_sq_sig_all(true)
        .build()
        .unwrap();
    ctx.ready(qp, PORT_NUM).unwrap();
    let mr = ctx.reg_mr(pd, 128, DEFAULT_ACCESS_FLAGS).unwrap();

    let sends: WrList<SendWr> = (0..8u64)
        .map(|i| SendWr::new(i, vec![ctx.mr_slice(mr, ..).unwrap()]))
        .collect();
    ctx.post_send(qp, &sends).unwrap();
    // completions that arrived before arming do not make the channel readable
    assert!(!helper::fd_ready(&ctx, cc));
    let wcs = ctx.poll_cq(cq, 16).unwrap();
    assert_eq!(
        wcs.iter().map(|wc| wc.wr_id()).collect::<Vec<_>>(),
        (0..8).collect::<Vec<_>>()
    );

    ctx.req_notify_cq(cq, false).unwrap();
    ctx.post_send(qp, &sends).unwrap();
    assert!(helper::fd_ready(&ctx, cc));
    assert_eq!(ctx.get_cq_event(cc, WaitPolicy::NoWait).unwrap(), (cq, 0));
    assert!(!helper::fd_ready(&ctx, cc));
    ctx.ack_cq_events(cq, 1).unwrap();
    assert_eq!(ctx.poll_cq(cq, 16).unwrap().len(), 8);

    ctx.destroy_qp(qp).unwrap();
    ctx.destroy_cq(cq).unwrap();
    ctx.destroy_comp_channel(cc).unwrap();
    ctx.dereg_mr(mr).unwrap();
    ctx.dealloc_pd(pd).unwrap();
    ctx.close().unwrap();
}

#[test]
fn receive_without_local_write() {
    let mut ctx = helper::open();
    let ep = helper::Endpoint::create(&mut ctx, None, 4);
    let frame = helper::frame(3, &[0x77; helper::PAYLOAD_LEN]);

    let read_only = ctx.reg_mr(ep.pd, 1024, AccessFlags::REMOTE_READ).unwrap();
    ctx.mr_bytes_mut(read_only).unwrap().fill(0xaa);
    let recvs: WrList<RecvWr> = [RecvWr::new(1, vec![ctx.mr_slice(read_only, ..).unwrap()])]
        .into_iter()
        .collect();
    ctx.post_recv(ep.qp, &recvs).unwrap();
    assert_eq!(
        ctx.deliver(ep.qp, &frame).unwrap(),
        Delivery::Completed {
            wr_id: 1,
            status: WcStatus::LocalProtectionError
        }
    );
    assert!(ctx.mr_bytes(read_only).unwrap().iter().all(|&b| b == 0xaa));
    let wcs = ctx.poll_cq(ep.cq, 4).unwrap();
    assert_eq!(wcs.len(), 1);
    assert_eq!(wcs[0].error(), Some((WcStatus::LocalProtectionError, 0)));

    let writable = ctx.reg_mr(ep.pd, 1024, AccessFlags::LOCAL_WRITE).unwrap();
    ctx.mr_bytes_mut(writable).unwrap().fill(0xaa);
    let recvs: WrList<RecvWr> = [RecvWr::new(2, vec![ctx.mr_slice(writable, ..).unwrap()])]
        .into_iter()
        .collect();
    ctx.post_recv(ep.qp, &recvs).unwrap();
    assert_eq!(
        ctx.deliver(ep.qp, &frame).unwrap(),
        Delivery::Completed {
            wr_id: 2,
            status: WcStatus::Success
        }
    );
    let bytes = ctx.mr_bytes(writable).unwrap();
    assert_eq!(&bytes[..frame.len()], &frame[..]);
    assert!(bytes[frame.len()..].iter().all(|&b| b == 0xaa));

    ctx.dereg_mr(read_only).unwrap();
    ctx.dereg_mr(writable).unwrap();
    ep.teardown(&mut ctx);
    ctx.close().unwrap();
}

#[test]
fn receive_too_short() {
    let mut ctx = helper::open();
    let ep = helper::Endpoint::create(&mut ctx, None, 4);
    let frame = helper::frame(0, &[1; helper::PAYLOAD_LEN]);
    let recvs: WrList<RecvWr> = [RecvWr::new(1, vec![ctx.mr_slice(ep.mr, ..HEADERS_LEN).unwrap()])]
        .into_iter()
        .collect();
    ctx.post_recv(ep.qp, &recvs).unwrap();
    assert_eq!(
        ctx.deliver(ep.qp, &frame).unwrap(),
        Delivery::Completed {
            wr_id: 1,
            status: WcStatus::LocalLengthError
        }
    );
    assert!(ctx.mr_bytes(ep.mr).unwrap().iter().all(|&b| b == 0));
    // no receive posted anymore
    assert_eq!(ctx.deliver(ep.qp, &frame).unwrap(), Delivery::Dropped);

    ep.teardown(&mut ctx);
    ctx.close().unwrap();
}

#[test]
fn multicast_mac_mapping() {
    assert_eq!(
        packet::multicast_mac(Ipv4Addr::new(239, 1, 2, 3)),
        [0x01, 0x00, 0x5e, 0x01, 0x02, 0x03]
    );
    // only the low 23 bits of the group survive
    assert_eq!(
        packet::multicast_mac(Ipv4Addr::new(224, 129, 2, 3)),
        packet::multicast_mac(Ipv4Addr::new(239, 1, 2, 3))
    );
}

mod helper {
    use std::net::Ipv4Addr;

    use ibverbs_model::packet::{MacAddr, UdpFrame};
    use ibverbs_model::{
        ChannelHandle, Context, CqHandle, Delivery, Device, DeviceList, MrHandle, PdHandle,
        QpHandle, QpType, RecvWr, WrList, DEFAULT_ACCESS_FLAGS, PORT_NUM,
    };
    use nix::poll::{PollFd, PollFlags, PollTimeout};

    pub const GROUP: Ipv4Addr = Ipv4Addr::new(239, 1, 2, 3);
    pub const SRC_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    pub const SRC_MAC: MacAddr = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    pub const PORT: u16 = 4791;
    pub const PAYLOAD_LEN: usize = 64;

    pub fn test_device(device_list: &DeviceList) -> Option<&Device> {
        device_list
            .iter()
            .find(|rdma_device| rdma_device.name() == "mlx5_0")
    }

    pub fn open() -> Context {
        let _ = env_logger::try_init();
        ibverbs_model::devices()
            .open_first()
            .expect("Could not open test device")
    }

    /// A multicast frame to `GROUP` carrying `payload`.
    pub fn frame(seq: u16, payload: &[u8]) -> Vec<u8> {
        UdpFrame::multicast(SRC_MAC, SRC_IP, GROUP)
            .ports(PORT, PORT)
            .seq(seq)
            .build(payload)
            .expect("Could not build frame")
    }

    /// Whether the channel's file descriptor polls readable right now.
    pub fn fd_ready(ctx: &Context, channel: ChannelHandle) -> bool {
        let fd = ctx.channel_fd(channel).expect("Could not get channel fd");
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        nix::poll::poll(&mut fds, PollTimeout::ZERO).expect("Could not poll channel fd") == 1
    }

    /// A raw packet queue pair in RTS that completes both sides on one CQ.
    pub struct Endpoint {
        pub pd: PdHandle,
        pub cq: CqHandle,
        pub qp: QpHandle,
        pub mr: MrHandle,
    }

    impl Endpoint {
        pub fn create(ctx: &mut Context, channel: Option<ChannelHandle>, depth: u32) -> Self {
            Self::create_with_context(ctx, channel, depth, 0)
        }

        pub fn create_with_context(
            ctx: &mut Context,
            channel: Option<ChannelHandle>,
            depth: u32,
            user_context: u64,
        ) -> Self {
            let pd = ctx.alloc_pd().expect("Could not allocate protection domain");
            let cq = ctx
                .create_cq(2 * depth as i32, user_context, channel, 0)
                .expect("Could not create completion queue");
            let qp = ctx
                .create_qp(pd, cq, cq, QpType::RawPacket)
                .set_max_send_wr(depth)
                .set_max_recv_wr(depth)
                .build()
                .expect("Could not create queue pair");
            ctx.ready(qp, PORT_NUM).expect("Could not bring queue pair to RTS");
            let mr = ctx
                .reg_mr(pd, 2048, DEFAULT_ACCESS_FLAGS)
                .expect("Could not register memory region");
            Endpoint { pd, cq, qp, mr }
        }

        pub fn teardown(self, ctx: &mut Context) {
            ctx.destroy_qp(self.qp).expect("Could not destroy queue pair");
            ctx.destroy_cq(self.cq).expect("Could not destroy completion queue");
            ctx.dereg_mr(self.mr).expect("Could not deregister memory region");
            ctx.dealloc_pd(self.pd).expect("Could not deallocate protection domain");
        }
    }

    pub fn post_recv(ctx: &mut Context, ep: &Endpoint, wr_id: u64) {
        let sge = ctx.mr_slice(ep.mr, ..).expect("Could not slice memory region");
        let recvs: WrList<RecvWr> = [RecvWr::new(wr_id, vec![sge])].into_iter().collect();
        ctx.post_recv(ep.qp, &recvs)
            .expect("failed to post receive request on queue pair");
    }

    /// Post one receive request and deliver a frame carrying `payload` to it.
    pub fn receive(ctx: &mut Context, ep: &Endpoint, wr_id: u64, payload: &[u8]) -> Delivery {
        post_recv(ctx, ep, wr_id);
        ctx.deliver(ep.qp, &frame(0, payload))
            .expect("failed to deliver frame")
    }
}
