//! Integration tests for bus discovery
//!
//! Covers:
//! - Registry contents and progress reporting
//! - Absent addresses and transient probe faults
//! - Re-discovery and teardown
//! - Recovery tier ordering
//! - Registry uniqueness over arbitrary buses (property test)

use common::test_utils::{BusCall, MockBus, MockHardReset, MockOp, RecordingProgress, ResetCall};
use common::{Error, NullProgress};
use protocol::{Address, BusFault};
use scout::config::ScoutConfig;
use scout::{BusController, DiscoveredDevice, DiscoveryState};
use std::time::Duration;

fn test_config() -> ScoutConfig {
    let mut config = ScoutConfig::default();
    config.controller.require_root = false;
    config.controller.use_lock = false;
    config.recovery.settle_time = Duration::ZERO;
    config.recovery.reset_on_teardown = false;
    config
}

fn addr(value: u8) -> Address {
    Address::new(value).unwrap()
}

mod registry {
    use super::*;

    #[test]
    fn test_single_device() {
        let bus = MockBus::new();
        bus.add_device(3, "INSTR-A");
        let mut controller =
            BusController::new(&test_config(), bus.clone(), MockHardReset::new()).unwrap();
        let progress = RecordingProgress::new();

        let registry = controller.discover(&progress).unwrap();
        assert_eq!(registry.keys().copied().collect::<Vec<_>>(), vec![addr(3)]);
        assert_eq!(registry[&addr(3)].identification(), Some("INSTR-A"));
        assert_eq!(
            controller.discovered(),
            vec![DiscoveredDevice {
                address: addr(3),
                identification: "INSTR-A".into(),
            }]
        );

        // only the responding address keeps a descriptor
        assert_eq!(bus.open_handles().len(), 1);
        assert_eq!(bus.count(|c| matches!(c, BusCall::Open(_))), 31);
        assert!(progress.saw("3: INSTR-A"));
    }

    #[test]
    fn test_probe_sequence() {
        let bus = MockBus::new();
        bus.add_device(0, "CTRL");
        let mut config = test_config();
        config.discovery.last_address = addr(0);
        let mut controller = BusController::new(&config, bus.clone(), MockHardReset::new()).unwrap();
        controller.discover(&NullProgress).unwrap();

        let h = controller.device(addr(0)).unwrap().handle();
        assert_eq!(
            bus.trace(),
            vec![
                BusCall::Reconfigure,
                BusCall::Open(0),
                BusCall::Clear(h),
                BusCall::Write(h, "*IDN?".into()),
                BusCall::Read(h),
            ]
        );
    }

    #[test]
    fn test_progress_after_every_address() {
        let bus = MockBus::new();
        bus.add_device(30, "LAST");
        let mut controller =
            BusController::new(&test_config(), bus, MockHardReset::new()).unwrap();
        let progress = RecordingProgress::new();
        controller.discover(&progress).unwrap();

        let fractions = progress.fractions();
        assert_eq!(fractions.len(), 31);
        assert!(fractions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(fractions.last().copied(), Some(1.0));
    }

    #[test]
    fn test_empty_bus_is_not_an_error() {
        let bus = MockBus::new();
        let mut controller =
            BusController::new(&test_config(), bus.clone(), MockHardReset::new()).unwrap();
        let progress = RecordingProgress::new();

        assert!(controller.discover(&progress).unwrap().is_empty());
        assert_eq!(controller.state(), DiscoveryState::Done);
        assert!(progress.saw("No GPIB devices found"));
        assert!(bus.open_handles().is_empty());
    }

    #[test]
    fn test_configured_range() {
        let bus = MockBus::new();
        bus.add_device(2, "OUTSIDE");
        bus.add_device(8, "INSIDE");
        let mut config = test_config();
        config.discovery.first_address = addr(5);
        config.discovery.last_address = addr(10);
        let mut controller = BusController::new(&config, bus.clone(), MockHardReset::new()).unwrap();

        let registry = controller.discover(&NullProgress).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains_key(&addr(8)));
        assert_eq!(bus.count(|c| matches!(c, BusCall::Open(_))), 6);
    }
}

mod probe_faults {
    use super::*;

    #[test]
    fn test_aborted_identify_recovers_and_finds_device() {
        let bus = MockBus::new();
        bus.add_device(3, "INSTR-A");
        bus.fail_next(MockOp::Read, BusFault::Aborted("EABO".into()));
        let mut controller =
            BusController::new(&test_config(), bus.clone(), MockHardReset::new()).unwrap();

        let registry = controller.discover(&NullProgress).unwrap();
        assert_eq!(registry[&addr(3)].identification(), Some("INSTR-A"));
        // bring-up plus one recovery pass
        assert_eq!(bus.count(|c| *c == BusCall::Reconfigure), 2);
        assert_eq!(bus.count(|c| *c == BusCall::Open(3)), 2);
        assert_eq!(bus.open_handles().len(), 1);
    }

    #[test]
    fn test_wedged_bus_is_not_reported_empty() {
        let bus = MockBus::new();
        bus.add_device(3, "INSTR-A");
        bus.jam(3, BusFault::Aborted("EABO".into()));
        let mut controller =
            BusController::new(&test_config(), bus.clone(), MockHardReset::new()).unwrap();

        let err = controller.discover(&NullProgress).unwrap_err();
        assert!(matches!(
            err,
            Error::Unrecoverable {
                operation: "discovery",
                last_fault: BusFault::Aborted(_),
                ..
            }
        ));
    }

    #[test]
    fn test_failed_run_closes_found_sessions() {
        let bus = MockBus::new();
        bus.add_device(2, "INSTR-A");
        bus.add_device(6, "INSTR-B");
        bus.jam(6, BusFault::Other("EBUS".into()));
        let mut controller =
            BusController::new(&test_config(), bus.clone(), MockHardReset::new()).unwrap();

        assert!(controller.discover(&NullProgress).is_err());
        assert_eq!(controller.state(), DiscoveryState::Idle);
        assert!(controller.registry().is_empty());
        assert!(controller.device(addr(2)).is_none());
        assert!(bus.open_handles().is_empty());
    }

    #[test]
    fn test_identification_padding_is_trimmed() {
        let bus = MockBus::new();
        bus.add_device(3, "INSTR-A   ");
        let mut controller =
            BusController::new(&test_config(), bus.clone(), MockHardReset::new()).unwrap();

        let registry = controller.discover(&NullProgress).unwrap();
        assert_eq!(registry[&addr(3)].identification(), Some("INSTR-A"));
    }

    #[test]
    fn test_transient_fault_reprobes_same_address() {
        let bus = MockBus::new();
        bus.add_device(3, "INSTR-A");
        bus.fail_next(MockOp::Read, BusFault::Other("EBUS".into()));
        let mut controller =
            BusController::new(&test_config(), bus.clone(), MockHardReset::new()).unwrap();

        let registry = controller.discover(&NullProgress).unwrap();
        assert_eq!(registry[&addr(3)].identification(), Some("INSTR-A"));
        assert_eq!(bus.count(|c| *c == BusCall::Open(3)), 2);
        assert_eq!(bus.count(|c| *c == BusCall::Reconfigure), 2);
        assert_eq!(bus.open_handles().len(), 1);
    }

    #[test]
    fn test_probe_budget_exhausted() {
        let bus = MockBus::new();
        bus.add_device(3, "INSTR-A");
        bus.add_device(4, "INSTR-B");
        for _ in 0..3 {
            bus.fail_next(MockOp::Read, BusFault::Other("EBUS".into()));
        }
        let mut controller =
            BusController::new(&test_config(), bus.clone(), MockHardReset::new()).unwrap();

        let err = controller.discover(&NullProgress).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            Error::Unrecoverable {
                operation: "discovery",
                attempts: 3,
                ..
            }
        ));
        assert_eq!(controller.state(), DiscoveryState::Idle);
        // address 4 was never reached
        assert_eq!(bus.count(|c| *c == BusCall::Open(4)), 0);
    }
}

mod rediscovery {
    use super::*;

    #[test]
    fn test_rediscovery_is_idempotent() {
        let bus = MockBus::new();
        bus.add_device(3, "INSTR-A");
        bus.add_device(17, "INSTR-B");
        let mut controller =
            BusController::new(&test_config(), bus.clone(), MockHardReset::new()).unwrap();

        controller.discover(&NullProgress).unwrap();
        let first = controller.discovered();
        let first_handles = bus.open_handles();

        controller.discover(&NullProgress).unwrap();
        assert_eq!(controller.discovered(), first);
        assert_eq!(bus.open_handles().len(), 2);
        // the first run's descriptors were closed before the second run opened new ones
        assert!(bus.open_handles().is_disjoint(&first_handles));
        for handle in first_handles {
            assert_eq!(bus.count(|c| *c == BusCall::Close(handle)), 1);
        }
    }

    #[test]
    fn test_device_appearing_between_runs() {
        let bus = MockBus::new();
        bus.add_device(3, "INSTR-A");
        let mut controller =
            BusController::new(&test_config(), bus.clone(), MockHardReset::new()).unwrap();
        controller.discover(&NullProgress).unwrap();

        bus.add_device(4, "INSTR-B");
        bus.remove_device(3);
        let registry = controller.discover(&NullProgress).unwrap();
        assert_eq!(registry.keys().copied().collect::<Vec<_>>(), vec![addr(4)]);
    }
}

mod teardown {
    use super::*;

    #[test]
    fn test_shutdown_closes_then_resets_adapter() {
        let bus = MockBus::new();
        bus.add_device(3, "INSTR-A");
        bus.add_device(4, "INSTR-B");
        let usb = MockHardReset::new();
        usb.add_device(1, 7, 0x3923, 0x709b);
        let mut config = test_config();
        config.recovery.reset_on_teardown = true;
        let mut controller = BusController::new(&config, bus.clone(), usb.clone()).unwrap();
        controller.discover(&NullProgress).unwrap();
        assert!(usb.trace().is_empty());

        controller.shutdown().unwrap();
        assert!(bus.open_handles().is_empty());
        assert_eq!(usb.trace(), vec![ResetCall::List, ResetCall::ResetDevice(1, 7)]);

        // a second shutdown is a no-op
        controller.shutdown().unwrap();
        assert_eq!(usb.count(|c| *c == ResetCall::List), 1);
    }

    #[test]
    fn test_drop_tears_down() {
        let bus = MockBus::new();
        bus.add_device(3, "INSTR-A");
        let mut controller =
            BusController::new(&test_config(), bus.clone(), MockHardReset::new()).unwrap();
        controller.discover(&NullProgress).unwrap();
        assert_eq!(bus.open_handles().len(), 1);

        drop(controller);
        assert!(bus.open_handles().is_empty());
    }

    #[test]
    fn test_adapter_reset_failure_is_not_an_error() {
        let bus = MockBus::new();
        let usb = MockHardReset::new();
        usb.add_device(1, 7, 0x3923, 0x709b);
        usb.fail_device(1, 7);
        let mut config = test_config();
        config.recovery.reset_on_teardown = true;
        let mut controller = BusController::new(&config, bus, usb).unwrap();
        controller.discover(&NullProgress).unwrap();

        assert!(controller.shutdown().is_ok());
    }
}

mod escalation {
    use super::*;

    #[test]
    fn test_tiers_run_in_order() {
        let bus = MockBus::new();
        bus.add_device(3, "INSTR-A");
        bus.fail_next(MockOp::Read, BusFault::Other("EBUS".into()));
        let usb = MockHardReset::new();
        usb.add_device(1, 7, 0x3923, 0x709b);
        usb.fail_device(1, 7);
        let mut config = test_config();
        config.recovery.host_controller_driver = Some("ehci-pci".into());
        let mut controller = BusController::new(&config, bus.clone(), usb.clone()).unwrap();

        controller.discover(&NullProgress).unwrap();
        assert_eq!(
            usb.trace(),
            vec![
                ResetCall::List,
                ResetCall::ResetDevice(1, 7),
                ResetCall::Rebind("ehci-pci".into()),
            ]
        );
        // bring-up, tier 1, and the reconfigure after the rebind
        assert_eq!(bus.count(|c| *c == BusCall::Reconfigure), 3);
    }

    #[test]
    fn test_startup_rebind() {
        let bus = MockBus::new();
        let usb = MockHardReset::new();
        let mut config = test_config();
        config.recovery.host_controller_driver = Some("xhci_hcd".into());
        config.recovery.rebind_on_startup = true;
        let mut controller = BusController::new(&config, bus, usb.clone()).unwrap();

        controller.discover(&NullProgress).unwrap();
        assert_eq!(usb.trace(), vec![ResetCall::Rebind("xhci_hcd".into())]);
    }
}

mod environment {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_root_requirement() {
        let mut config = test_config();
        config.controller.require_root = true;
        let result = BusController::new(&config, MockBus::new(), MockHardReset::new());

        if nix::unistd::geteuid().is_root() {
            assert!(result.is_ok());
        } else {
            let err = result.err().unwrap();
            assert!(matches!(err, Error::Privilege(_)));
            assert!(err.is_configuration());
        }
    }

    #[test]
    fn test_discovery_holds_lock_file() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("lock").join("gpib-scout.lock");
        let bus = MockBus::new();
        bus.add_device(3, "INSTR-A");
        let mut config = test_config();
        config.controller.use_lock = true;
        config.controller.lock_path = lock_path.clone();
        let mut controller = BusController::new(&config, bus, MockHardReset::new()).unwrap();

        assert_eq!(controller.discover(&NullProgress).unwrap().len(), 1);
        assert!(lock_path.exists());
    }

    #[test]
    fn test_bad_adapter_signature_rejected() {
        let mut config = test_config();
        config.recovery.adapter_ids = vec!["3923".into()];
        let result = BusController::new(&config, MockBus::new(), MockHardReset::new());
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

mod properties {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Property: the registry holds exactly the responding addresses, once each
        #[test]
        fn prop_registry_matches_responders(
            responders in prop::collection::btree_map(0u8..=30, "[A-Z]{2,8},[0-9]{1,4}", 0..8usize),
        ) {
            let bus = MockBus::new();
            for (address, idn) in &responders {
                bus.add_device(*address, idn);
            }
            let mut controller =
                BusController::new(&test_config(), bus.clone(), MockHardReset::new()).unwrap();

            let found: BTreeMap<u8, String> = controller
                .discover(&NullProgress)
                .unwrap()
                .iter()
                .map(|(address, session)| {
                    (address.value(), session.identification().unwrap_or_default().to_string())
                })
                .collect();

            prop_assert_eq!(&found, &responders);
            prop_assert_eq!(bus.open_handles().len(), responders.len());
        }
    }
}
