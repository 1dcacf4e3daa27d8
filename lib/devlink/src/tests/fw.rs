use super::harness::{Fixture, take_logs};
use crate::{
    DevicePtr, DevlinkConfig, DpmOrder, FwDevlinkMode, FwNodeFlags, FwNodePtr, LinkFlags, LinkStatus,
    ProbeDefer, ProbeStatus,
};
use log::Level;

fn mode(fw_devlink: FwDevlinkMode) -> Fixture {
    Fixture::with_config(DevlinkConfig {
        fw_devlink,
        ..DevlinkConfig::default()
    })
}

#[test]
fn consumer_waits_until_the_supplier_device_exists() {
    let fx = Fixture::new();
    let fc = FwNodePtr::new_root("consumer@0");
    let fs = FwNodePtr::new_root("clock@1");
    fc.add_supplier_ref(&fs);

    let c = fx.add_fw("c", &fc);
    assert!(fx.graph.waiting_for_supplier(&c));
    assert_eq!(fx.bind(&c), Err(ProbeDefer::WaitingForSupplier));
    assert_eq!(c.probe_status(), ProbeStatus::NoDriver);

    let s = fx.add_fw("s", &fs);
    assert!(!fx.graph.waiting_for_supplier(&c));
    let link = fx.link(&c, &s);
    assert_eq!(
        link.flags(),
        LinkFlags::MANAGED | LinkFlags::INFERRED | LinkFlags::AUTOPROBE_CONSUMER
    );
    assert_eq!(fx.bind(&c), Err(ProbeDefer::SupplierNotReady));

    fx.bind(&s).unwrap();
    assert_eq!(fx.hooks().retries(), ["c"]);
    fx.bind(&c).unwrap();
    assert_eq!(link.status(), LinkStatus::Active);
    fx.assert_ordered();
}

#[test]
fn supplier_first_links_at_consumer_creation() {
    let fx = Fixture::new();
    let fc = FwNodePtr::new_root("consumer@0");
    let fs = FwNodePtr::new_root("regulator@1");
    fc.add_supplier_ref(&fs);

    let s = fx.add_fw("s", &fs);
    let c = fx.add_fw("c", &fc);
    assert!(fx.graph.find_link(&c, &s).is_some());
    assert!(!fx.graph.waiting_for_supplier(&c));
}

#[test]
fn permissive_mode_never_blocks_probing() {
    let fx = mode(FwDevlinkMode::Permissive);
    let fc = FwNodePtr::new_root("consumer@0");
    let fs = FwNodePtr::new_root("clock@1");
    let fgone = FwNodePtr::new_root("absent@2");
    fc.add_supplier_ref(&fs);
    fc.add_supplier_ref(&fgone);

    let c = fx.add_fw("c", &fc);
    let s = fx.add_fw("s", &fs);
    assert_eq!(
        fx.link(&c, &s).flags(),
        LinkFlags::MANAGED | LinkFlags::INFERRED | LinkFlags::SYNC_STATE_ONLY
    );
    assert!(fx.graph.waiting_for_supplier(&c));

    fx.bind(&c).unwrap();
    // The bound consumer no longer cares about suppliers that never showed up.
    assert!(!fx.graph.waiting_for_supplier(&c));
    assert!(fx.graph.find_link(&c, &s).is_none());
}

#[test]
fn off_mode_ignores_firmware() {
    let fx = mode(FwDevlinkMode::Off);
    let fc = FwNodePtr::new_root("consumer@0");
    let fs = FwNodePtr::new_root("clock@1");
    fc.add_supplier_ref(&fs);

    let c = fx.add_fw("c", &fc);
    fx.add_fw("s", &fs);
    assert!(fx.graph.links().is_empty());
    assert!(!fc.flags().contains(FwNodeFlags::LINKS_ADDED));
    fx.bind(&c).unwrap();
}

#[test]
fn descendants_without_devices_get_proxy_links() {
    let fx = Fixture::new();
    let fbus = FwNodePtr::new_root("bus@0");
    let fchild = fbus.new_child("sensor@10");
    let fs = FwNodePtr::new_root("gpio@1");
    fchild.add_supplier_ref(&fs);

    let bus = fx.add_fw("bus", &fbus);
    let s = fx.add_fw("s", &fs);
    let proxy = fx.link(&bus, &s);
    assert!(proxy.flags().contains(LinkFlags::SYNC_STATE_ONLY));
    assert!(!proxy.is_hard());

    // The proxy never blocks the bus, and goes away once the bus binds.
    fx.bind(&bus).unwrap();
    assert!(fx.graph.find_link(&bus, &s).is_none());
    assert!(fchild.flags().contains(FwNodeFlags::NOT_DEVICE));
}

#[test]
fn firmware_cycle_is_relaxed() {
    let fx = Fixture::new();
    let fa = FwNodePtr::new_root("a");
    let fb = FwNodePtr::new_root("b");
    let fc = FwNodePtr::new_root("c");
    fa.add_supplier_ref(&fb);
    fb.add_supplier_ref(&fc);
    fc.add_supplier_ref(&fa);

    let a = fx.add_fw("a", &fa);
    let b = fx.add_fw("b", &fb);
    let ab = fx.link(&a, &b);
    assert!(ab.is_hard());
    take_logs();

    let c = fx.add_fw("c", &fc);
    let bc = fx.link(&b, &c);
    let ca = fx.link(&c, &a);
    assert!(
        take_logs()
            .iter()
            .any(|(level, msg)| *level == Level::Info && msg.contains("cyclic dependency"))
    );
    assert!(!ca.is_hard());
    assert!(!ab.is_hard() || !bc.is_hard());
    for link in [&ab, &bc, &ca] {
        assert!(link.flags().contains(LinkFlags::MANAGED | LinkFlags::INFERRED));
    }
    // The offending pair is never tried again.
    assert!(!fx.graph.add_pending_fw_edge(&fc, &fa));
    fx.assert_ordered();

    for dev in [&a, &b, &c] {
        fx.bind(dev).unwrap();
        assert_eq!(dev.probe_status(), ProbeStatus::DriverBound);
    }
}

#[test]
fn relaxing_terminates_on_a_cycle_through_the_device_tree() {
    let fx = Fixture::new();
    let a = fx.add("a");
    let b = fx.add("b");
    let x = fx.add("x");
    let y = fx.add("y");
    fx.graph.add_link(&a, &b, LinkFlags::INFERRED).unwrap();
    fx.graph.add_link(&x, &b, LinkFlags::INFERRED).unwrap();
    // b supplies a, and now also sits below it.
    fx.graph.move_device(&b, Some(&a), DpmOrder::None).unwrap();
    let ba = fx.link(&a, &b);
    let bx = fx.link(&x, &b);
    let hard = LinkFlags::MANAGED | LinkFlags::INFERRED;

    let mut w = fx.graph.write();
    assert!(!fx.graph.relax_cycle(&mut w, &a, &y));
    assert_eq!(ba.flags(), hard);
    assert_eq!(bx.flags(), hard);

    assert!(fx.graph.relax_cycle(&mut w, &a, &x));
    drop(w);
    assert_eq!(ba.flags(), hard | LinkFlags::SYNC_STATE_ONLY);
    assert_eq!(bx.flags(), hard | LinkFlags::SYNC_STATE_ONLY);
}

#[test]
fn supplier_below_a_dependent_is_a_false_link() {
    let fx = Fixture::new();
    let fparent = FwNodePtr::new_root("mfd@0");
    let fsup = fparent.new_child("pinctrl@4");
    let fcon = FwNodePtr::new_root("consumer@1");
    fcon.add_supplier_ref(&fsup);

    let parent = fx.add_fw("mfd", &fparent);
    let con = DevicePtr::new("con", Some(fcon.clone()));
    fx.register(&con);
    fx.graph.add_link(&parent, &con, LinkFlags::empty()).unwrap();

    fx.graph.materialize(&con);
    assert!(!fx.graph.waiting_for_supplier(&con));
    assert!(!fx.graph.add_pending_fw_edge(&fcon, &fsup));
}

#[test]
fn supplier_initialized_without_a_device_is_dropped() {
    let fx = Fixture::new();
    let fc = FwNodePtr::new_root("consumer@0");
    let fs = FwNodePtr::new_root("early-clock@1");
    fs.insert_flags(FwNodeFlags::INITIALIZED);
    fc.add_supplier_ref(&fs);

    let c = fx.add_fw("c", &fc);
    assert!(!fx.graph.waiting_for_supplier(&c));
    fx.bind(&c).unwrap();
}

#[test]
fn unmatched_suppliers_stop_blocking_once_drivers_are_registered() {
    let fx = Fixture::new();
    let fc = FwNodePtr::new_root("consumer@0");
    let fs = FwNodePtr::new_root("phy@1");
    fc.add_supplier_ref(&fs);
    let s = fx.add_fw("s", &fs);
    let c = fx.add_fw("c", &fc);
    assert_eq!(fx.bind(&c), Err(ProbeDefer::SupplierNotReady));

    fx.hooks()
        .cannot_match
        .lock()
        .unwrap()
        .push("s".to_string());
    fx.graph.drivers_done();
    assert_eq!(
        fx.link(&c, &s).flags(),
        LinkFlags::MANAGED | LinkFlags::INFERRED | LinkFlags::SYNC_STATE_ONLY
    );
    fx.bind(&c).unwrap();
}

#[test]
fn late_unmatched_supplier_unblocks_its_consumers() {
    let fx = mode(FwDevlinkMode::Rpm);
    fx.graph.drivers_done();
    fx.hooks()
        .cannot_match
        .lock()
        .unwrap()
        .push("s".to_string());
    let fc = FwNodePtr::new_root("consumer@0");
    let fs = FwNodePtr::new_root("phy@1");
    fc.add_supplier_ref(&fs);

    let c = fx.add_fw("c", &fc);
    let s = fx.add_fw("s", &fs);
    let link = fx.link(&c, &s);
    assert!(!link.flags().contains(LinkFlags::PM_RUNTIME));
    assert!(!link.is_hard());
    assert_eq!(fx.hooks().rpm_links(), ["c"]);
    assert_eq!(fx.hooks().rpm_dropped(), ["c"]);
    fx.bind(&c).unwrap();
}

#[test]
fn pending_edges_are_parsed_once_and_purged() {
    let fx = Fixture::new();
    let fa = FwNodePtr::new_root("a");
    let fb = FwNodePtr::new_root("b");
    fa.add_supplier_ref(&fb);

    fx.graph.parse_fwtree(&fa);
    assert!(fa.flags().contains(FwNodeFlags::LINKS_ADDED));
    assert!(!fx.graph.add_pending_fw_edge(&fa, &fb));

    fx.graph.purge_fw_links(&fb);
    fx.graph.parse_fwtree(&fa);
    assert!(fx.graph.add_pending_fw_edge(&fa, &fb));

    fx.graph.purge_absent_suppliers(&fb);
    assert!(fb.flags().contains(FwNodeFlags::NOT_DEVICE));
    let a = fx.add_fw("a", &fa);
    assert!(!fx.graph.waiting_for_supplier(&a));
}
