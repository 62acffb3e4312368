mod helpers;

use std::sync::Arc;
use std::time::Duration;

use dserverd::data::{AttrData, AttrHistory, AttributeValue, DevSource, LongStringArray};
use dserverd::dserver::{AdminCommand, POOL_CONF_PROP};
use dserverd::error::DsError;
use dserverd::polling::PollObjKind;
use dserverd::properties::{MemoryPropertyStore, PropertyStore};
use dserverd::routes::admin::{AddObjPolling, DevPollStatus, RemObjPolling, StatusResponse};
use dserverd::routes::DiscoveryInfo;

use crate::helpers::{
    add_test_device, obj_args, poll_args, start_test_dserver, start_test_dserver_with_store,
    test_settings, TestApp, TEST_DEVICE, TEST_IDL,
};

fn strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_first_object_creates_worker_and_last_removal_kills_it() {
    let (dserver, _observer) = start_test_dserver(test_settings());
    assert!(dserver.pool().workers().is_empty());

    dserver
        .add_obj_polling(
            &poll_args(100, TEST_DEVICE, "attribute", "Temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();

    let workers = dserver.pool().workers();
    assert_eq!(workers.len(), 1);
    assert_eq!(
        dserver.pool().devices_of(workers[0].id()),
        vec![TEST_DEVICE.to_string()]
    );
    assert_eq!(dserver.polled_device(), vec![TEST_DEVICE.to_string()]);

    dserver
        .rem_obj_polling(&obj_args(TEST_DEVICE, "attribute", "temperature"), true, None)
        .unwrap();

    assert!(dserver.pool().workers().is_empty());
    assert!(dserver.pool().worker_for(TEST_DEVICE).is_none());
    assert!(dserver.polled_device().is_empty());
    assert!(workers[0].is_finished());
}

#[tokio::test]
async fn test_second_object_reuses_worker() {
    let (dserver, _observer) = start_test_dserver(test_settings());
    for name in ["temperature", "counter"] {
        dserver
            .add_obj_polling(
                &poll_args(100, TEST_DEVICE, "attribute", name),
                true,
                Duration::ZERO,
                None,
            )
            .unwrap();
    }
    dserver
        .add_obj_polling(
            &poll_args(100, TEST_DEVICE, "command", "GetCounter"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();

    let workers = dserver.pool().workers();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].nb_polled_objects(), 3);

    // Removing one object keeps the worker alive.
    dserver
        .rem_obj_polling(&obj_args(TEST_DEVICE, "command", "getcounter"), true, None)
        .unwrap();
    assert_eq!(dserver.pool().workers().len(), 1);
    assert_eq!(dserver.pool().workers()[0].nb_polled_objects(), 2);
    dserver.shutdown();
}

#[tokio::test]
async fn test_add_already_polled_keeps_existing_object() {
    let (dserver, _observer) = start_test_dserver(test_settings());
    let args = poll_args(50, TEST_DEVICE, "attribute", "temperature");
    dserver.add_obj_polling(&args, true, Duration::ZERO, None).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let dev = dserver.registry().get(TEST_DEVICE).unwrap();
    let before = dev
        .poll()
        .find(PollObjKind::Attribute, "temperature")
        .cloned()
        .unwrap();
    let recorded = before.lock().ring.len();
    assert!(recorded > 0);

    let err = dserver
        .add_obj_polling(
            &poll_args(1000, TEST_DEVICE, "Attribute", "TEMPERATURE"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, DsError::AlreadyPolled(_)));
    assert_eq!(err.reason(), "API_AlreadyPolled");

    let after = dev
        .poll()
        .find(PollObjKind::Attribute, "temperature")
        .cloned()
        .unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.upd(), Duration::from_millis(50));
    assert!(after.lock().ring.len() >= recorded);
    assert_eq!(dev.poll().objects.len(), 1);
    dserver.shutdown();
}

#[tokio::test]
async fn test_status_command_is_polled_as_attribute() {
    let (dserver, _observer) = start_test_dserver(test_settings());
    dserver
        .add_obj_polling(
            &poll_args(500, TEST_DEVICE, "command", "Status"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();

    let dev = dserver.registry().get(TEST_DEVICE).unwrap();
    assert!(dev.poll().find(PollObjKind::Attribute, "status").is_some());
    assert!(dev.poll().find(PollObjKind::Command, "status").is_none());

    for kind in ["command", "attribute"] {
        let err = dserver
            .add_obj_polling(
                &poll_args(500, TEST_DEVICE, kind, "status"),
                true,
                Duration::ZERO,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, DsError::AlreadyPolled(_)));
    }
    assert_eq!(dev.poll().objects.len(), 1);
    dserver.shutdown();
}

#[tokio::test]
async fn test_status_command_stays_a_command_on_old_devices() {
    let (dserver, _observer) = start_test_dserver(test_settings());
    add_test_device(&dserver, "old/dev/1", 2);
    dserver
        .add_obj_polling(
            &poll_args(500, "old/dev/1", "command", "Status"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();

    let dev = dserver.registry().get("old/dev/1").unwrap();
    assert!(dev.poll().find(PollObjKind::Command, "status").is_some());
    dserver.shutdown();
}

#[tokio::test]
async fn test_remove_absent_object() {
    let (dserver, _observer) = start_test_dserver(test_settings());

    let err = dserver
        .rem_obj_polling(&obj_args(TEST_DEVICE, "attribute", "temperature"), true, None)
        .unwrap_err();
    assert!(matches!(err, DsError::DeviceNotPolled(_)));

    dserver
        .add_obj_polling(
            &poll_args(100, TEST_DEVICE, "attribute", "temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();
    let err = dserver
        .rem_obj_polling(&obj_args(TEST_DEVICE, "attribute", "counter"), true, None)
        .unwrap_err();
    assert!(matches!(err, DsError::PollObjNotFound(_)));

    let dev = dserver.registry().get(TEST_DEVICE).unwrap();
    assert_eq!(dev.poll().objects.len(), 1);
    assert!(dev.poll().find(PollObjKind::Attribute, "temperature").is_some());
    dserver.shutdown();
}

#[tokio::test]
async fn test_period_below_minimum() {
    let mut settings = test_settings();
    settings.min_poll_period_ms = 20;
    let (dserver, _observer) = start_test_dserver(settings);

    let err = dserver
        .add_obj_polling(
            &poll_args(5, TEST_DEVICE, "attribute", "temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, DsError::NotSupported(_)));

    // Below the process-wide floor.
    let err = dserver
        .add_obj_polling(
            &poll_args(3, TEST_DEVICE, "attribute", "temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, DsError::NotSupported(_)));

    let dev = dserver.registry().get(TEST_DEVICE).unwrap();
    assert!(dev.poll().objects.is_empty());
    assert!(dserver.pool().workers().is_empty());

    dserver
        .add_obj_polling(
            &poll_args(20, TEST_DEVICE, "attribute", "temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();
    dserver.shutdown();
}

#[tokio::test]
async fn test_period_above_maximum() {
    let (dserver, _observer) = start_test_dserver(test_settings());
    let too_long = i64::from(u32::MAX) + 1;

    let err = dserver
        .add_obj_polling(
            &poll_args(too_long, TEST_DEVICE, "attribute", "temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, DsError::NotSupported(_)));
    let dev = dserver.registry().get(TEST_DEVICE).unwrap();
    assert!(dev.poll().objects.is_empty());

    dserver
        .add_obj_polling(
            &poll_args(100, TEST_DEVICE, "attribute", "temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();
    let err = dserver
        .upd_obj_polling_period(
            &poll_args(too_long, TEST_DEVICE, "attribute", "temperature"),
            true,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, DsError::NotSupported(_)));
    assert_eq!(dev.attr_polling_period("temperature"), 100);
    dserver.shutdown();
}

#[tokio::test]
async fn test_add_rolls_back_when_new_worker_misses_deadline() {
    let mut settings = test_settings();
    // A freshly spawned worker can never acknowledge within a zero deadline.
    settings.cmd_timeout = Duration::ZERO;
    let (dserver, _observer) = start_test_dserver(settings);

    let err = dserver
        .add_obj_polling(
            &poll_args(100, TEST_DEVICE, "attribute", "temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, DsError::CommandTimedOut(_)));

    let dev = dserver.registry().get(TEST_DEVICE).unwrap();
    assert!(dev.poll().objects.is_empty());
    assert!(dserver.polled_device().is_empty());
    assert!(dserver.pool().workers().is_empty());
    assert!(dserver.pool().worker_for(TEST_DEVICE).is_none());
    assert!(dserver.pool_assignment().is_empty());
    dserver.shutdown();
}

#[tokio::test]
async fn test_device_minimum_period_overrides() {
    let store = Arc::new(MemoryPropertyStore::new());
    store
        .put_device_property(TEST_DEVICE, "min_poll_period", &strings(&["100"]))
        .unwrap();
    store
        .put_device_property(TEST_DEVICE, "attr_min_poll_period", &strings(&["counter", "500"]))
        .unwrap();
    let (dserver, _observer) = start_test_dserver_with_store(test_settings(), store, false);

    let add = |name: &str, period: i64| {
        dserver.add_obj_polling(
            &poll_args(period, TEST_DEVICE, "attribute", name),
            false,
            Duration::ZERO,
            None,
        )
    };
    assert!(matches!(add("temperature", 50), Err(DsError::NotSupported(_))));
    add("temperature", 100).unwrap();
    assert!(matches!(add("counter", 200), Err(DsError::NotSupported(_))));
    add("counter", 500).unwrap();
    // Externally triggered objects have no minimum.
    add("auto", 0).unwrap();
    dserver.shutdown();
}

#[tokio::test]
async fn test_forwarded_attribute_is_rejected() {
    let (dserver, _observer) = start_test_dserver(test_settings());
    let err = dserver
        .add_obj_polling(
            &poll_args(100, TEST_DEVICE, "attribute", "fwd"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap_err();
    match err {
        DsError::NotSupportedFeature(msg) => assert!(msg.contains("other/dev/1/temperature")),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(dserver.pool().workers().is_empty());
}

#[tokio::test]
async fn test_add_argument_checks() {
    let (dserver, _observer) = start_test_dserver(test_settings());
    let add = |argin: LongStringArray| dserver.add_obj_polling(&argin, true, Duration::ZERO, None);

    assert!(matches!(
        add(LongStringArray::new(vec![100], vec![TEST_DEVICE, "attribute"])),
        Err(DsError::WrongNumberOfArgs)
    ));
    assert!(matches!(
        add(LongStringArray::new(vec![], vec![TEST_DEVICE, "attribute", "temperature"])),
        Err(DsError::WrongNumberOfArgs)
    ));
    assert!(matches!(
        add(poll_args(100, "no/such/dev", "attribute", "temperature")),
        Err(DsError::DeviceNotFound(_))
    ));
    assert!(matches!(
        add(poll_args(100, TEST_DEVICE, "pipe", "temperature")),
        Err(DsError::NotSupported(_))
    ));
    assert!(matches!(
        add(poll_args(100, TEST_DEVICE, "command", "Init")),
        Err(DsError::NotSupported(_))
    ));
    assert!(matches!(
        add(poll_args(100, TEST_DEVICE, "command", "SetValue")),
        Err(DsError::IncompatibleCmdArgument(_))
    ));
    assert!(matches!(
        add(poll_args(100, TEST_DEVICE, "command", "Explode")),
        Err(DsError::CommandNotFound(_))
    ));
    assert!(matches!(
        add(poll_args(100, TEST_DEVICE, "attribute", "pressure")),
        Err(DsError::AttrNotFound(_))
    ));
    assert!(dserver.pool().workers().is_empty());
}

#[tokio::test]
async fn test_locked_device_refuses_other_clients() {
    let (dserver, _observer) = start_test_dserver(test_settings());
    dserver.registry().get(TEST_DEVICE).unwrap().lock("alice").unwrap();

    let args = poll_args(100, TEST_DEVICE, "attribute", "temperature");
    let err = dserver
        .add_obj_polling(&args, true, Duration::ZERO, Some("bob"))
        .unwrap_err();
    assert!(matches!(err, DsError::DeviceLocked(_)));
    let err = dserver
        .add_obj_polling(&args, true, Duration::ZERO, None)
        .unwrap_err();
    assert!(matches!(err, DsError::DeviceLocked(_)));

    dserver
        .add_obj_polling(&args, true, Duration::ZERO, Some("alice"))
        .unwrap();
    let err = dserver
        .rem_obj_polling(&obj_args(TEST_DEVICE, "attribute", "temperature"), true, Some("bob"))
        .unwrap_err();
    assert!(matches!(err, DsError::DeviceLocked(_)));
    dserver.shutdown();
}

#[tokio::test]
async fn test_status_before_first_poll_then_cache_read() {
    let (dserver, _observer) = start_test_dserver(test_settings());
    dserver.stop_polling().unwrap();

    dserver
        .add_obj_polling(
            &poll_args(1000, TEST_DEVICE, "attribute", "temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();

    let status = dserver.dev_poll_status(TEST_DEVICE).unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(
        status[0],
        "Polled attribute name = Temperature\n\
         Polling period (mS) = 1000\n\
         Polling ring buffer depth = 10\n\
         No data recorded yet"
    );

    dserver.start_polling().unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let values = dserver
        .read_attributes_2(TEST_DEVICE, &strings(&["temperature"]), DevSource::CacheDevice)
        .unwrap();
    assert_eq!(values[0].data, AttrData::Double(vec![helpers::TEMPERATURE]));

    let status = dserver.dev_poll_status(TEST_DEVICE).unwrap();
    assert!(status[0].contains("Time needed for the last attribute reading (mS) = "));
    assert!(status[0].contains("Data not updated since "));
    dserver.shutdown();
}

#[tokio::test]
async fn test_same_period_attributes_are_read_together() {
    let (dserver, mut observer) = start_test_dserver(test_settings());
    for name in ["temperature", "counter"] {
        dserver
            .add_obj_polling(
                &poll_args(100, TEST_DEVICE, "attribute", name),
                true,
                Duration::ZERO,
                None,
            )
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(450)).await;

    let reads = observer.read_history();
    assert!(reads
        .iter()
        .any(|names| names == &strings(&["temperature", "counter"])));

    let status = dserver.dev_poll_status(TEST_DEVICE).unwrap();
    assert_eq!(status.len(), 2);
    assert!(status[0].contains("attributes (Temperature + Counter) reading (mS) = "));
    dserver.shutdown();
}

#[tokio::test]
async fn test_polling_before_9_reads_attributes_one_by_one() {
    let mut settings = test_settings();
    settings.polling_before_9 = true;
    let (dserver, mut observer) = start_test_dserver(settings);
    for name in ["temperature", "counter"] {
        dserver
            .add_obj_polling(
                &poll_args(100, TEST_DEVICE, "attribute", name),
                true,
                Duration::ZERO,
                None,
            )
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(350)).await;

    let reads = observer.read_history();
    assert!(!reads.is_empty());
    assert!(reads.iter().all(|names| names.len() == 1));

    let status = dserver.dev_poll_status(TEST_DEVICE).unwrap();
    assert!(status[0].contains("attribute reading(ms) = "));
    dserver.shutdown();
}

#[tokio::test]
async fn test_state_status_reported_in_both_sections() {
    let (dserver, _observer) = start_test_dserver(test_settings());
    dserver
        .add_obj_polling(
            &poll_args(200, TEST_DEVICE, "attribute", "temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();
    dserver
        .add_obj_polling(
            &poll_args(300, TEST_DEVICE, "attribute", "State"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();

    let status = dserver.dev_poll_status(TEST_DEVICE).unwrap();
    assert_eq!(status.len(), 3);
    assert!(status[0].starts_with("Polled command name = State"));
    assert!(status[1].starts_with("Polled attribute name = Temperature"));
    assert!(status[2].starts_with("Polled attribute name = State"));
    dserver.shutdown();
}

#[tokio::test]
async fn test_polling_lists_are_persisted() {
    let store = Arc::new(MemoryPropertyStore::new());
    let (dserver, _observer) = start_test_dserver_with_store(test_settings(), store.clone(), true);
    let admin = dserver.settings().admin_name.clone();

    dserver
        .add_obj_polling(
            &poll_args(200, TEST_DEVICE, "attribute", "Temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();
    assert_eq!(
        store.get_device_property(TEST_DEVICE, "polled_attr").unwrap(),
        Some(strings(&["temperature", "200"]))
    );
    assert_eq!(
        store.get_device_property(&admin, POOL_CONF_PROP).unwrap(),
        Some(strings(&[TEST_DEVICE]))
    );

    dserver
        .upd_obj_polling_period(
            &poll_args(300, TEST_DEVICE, "attribute", "temperature"),
            true,
            None,
        )
        .unwrap();
    assert_eq!(
        store.get_device_property(TEST_DEVICE, "polled_attr").unwrap(),
        Some(strings(&["temperature", "300"]))
    );
    let dev = dserver.registry().get(TEST_DEVICE).unwrap();
    assert_eq!(
        dev.poll()
            .find(PollObjKind::Attribute, "temperature")
            .unwrap()
            .upd(),
        Duration::from_millis(300)
    );
    assert_eq!(dev.attr_polling_period("temperature"), 300);

    dserver
        .rem_obj_polling(&obj_args(TEST_DEVICE, "attribute", "temperature"), true, None)
        .unwrap();
    assert_eq!(store.get_device_property(TEST_DEVICE, "polled_attr").unwrap(), None);
    assert_eq!(store.get_device_property(&admin, POOL_CONF_PROP).unwrap(), None);
    assert_eq!(dev.attr_polling_period("temperature"), 0);
}

#[tokio::test]
async fn test_nothing_persisted_without_database() {
    let store = Arc::new(MemoryPropertyStore::new());
    let (dserver, _observer) =
        start_test_dserver_with_store(test_settings(), store.clone(), false);
    dserver
        .add_obj_polling(
            &poll_args(200, TEST_DEVICE, "attribute", "temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();
    assert_eq!(store.get_device_property(TEST_DEVICE, "polled_attr").unwrap(), None);
    assert_eq!(
        store
            .get_device_property(&dserver.settings().admin_name, POOL_CONF_PROP)
            .unwrap(),
        None
    );
    dserver.shutdown();
}

#[tokio::test]
async fn test_startup_configuration_from_store() {
    let store = Arc::new(MemoryPropertyStore::new());
    store
        .put_device_property(TEST_DEVICE, "polled_attr", &strings(&["Temperature", "100"]))
        .unwrap();
    store
        .put_device_property(TEST_DEVICE, "polled_cmd", &strings(&["GetCounter", "150"]))
        .unwrap();
    let (dserver, _observer) = start_test_dserver_with_store(test_settings(), store.clone(), true);

    dserver.configure_polling();

    let dev = dserver.registry().get(TEST_DEVICE).unwrap();
    assert!(dev.poll().find(PollObjKind::Attribute, "temperature").is_some());
    assert!(dev.poll().find(PollObjKind::Command, "getcounter").is_some());
    // Polling period declared in code.
    let auto = dev.poll().find(PollObjKind::Attribute, "auto").cloned().unwrap();
    assert_eq!(auto.upd(), Duration::from_millis(200));
    // Startup does not rewrite the device lists.
    assert_eq!(
        store.get_device_property(TEST_DEVICE, "polled_attr").unwrap(),
        Some(strings(&["Temperature", "100"]))
    );

    // Removing an attribute polled from code remembers it.
    dserver
        .rem_obj_polling(&obj_args(TEST_DEVICE, "attribute", "auto"), true, None)
        .unwrap();
    assert_eq!(
        store.get_device_property(TEST_DEVICE, "non_auto_polled_attr").unwrap(),
        Some(strings(&["auto"]))
    );
    dserver.shutdown();
}

#[tokio::test]
async fn test_non_auto_polled_attribute_is_skipped_at_startup() {
    let store = Arc::new(MemoryPropertyStore::new());
    store
        .put_device_property(TEST_DEVICE, "non_auto_polled_attr", &strings(&["Auto"]))
        .unwrap();
    let (dserver, _observer) = start_test_dserver_with_store(test_settings(), store, true);

    dserver.configure_polling();

    assert!(dserver.polled_device().is_empty());
    assert!(dserver.pool().workers().is_empty());
}

#[tokio::test]
async fn test_pool_size_bounds_worker_count() {
    let (dserver, _observer) = start_test_dserver(test_settings());
    let _other = add_test_device(&dserver, "test/dev/2", TEST_IDL);
    for device in [TEST_DEVICE, "test/dev/2"] {
        dserver
            .add_obj_polling(
                &poll_args(100, device, "attribute", "temperature"),
                true,
                Duration::ZERO,
                None,
            )
            .unwrap();
    }

    let assignment = dserver.pool_assignment();
    assert_eq!(assignment.len(), 1);
    let devices = assignment.values().next().unwrap();
    assert_eq!(devices.len(), 2);
    dserver.shutdown();
}

#[tokio::test]
async fn test_bigger_pool_spreads_devices() {
    let mut settings = test_settings();
    settings.pool_size = 2;
    let (dserver, _observer) = start_test_dserver(settings);
    let _other = add_test_device(&dserver, "test/dev/2", TEST_IDL);
    for device in [TEST_DEVICE, "test/dev/2"] {
        dserver
            .add_obj_polling(
                &poll_args(100, device, "attribute", "temperature"),
                true,
                Duration::ZERO,
                None,
            )
            .unwrap();
    }
    assert_eq!(dserver.pool().workers().len(), 2);

    dserver.stop_device_polling("test/dev/2").unwrap();
    assert_eq!(dserver.pool().workers().len(), 1);
    assert_eq!(dserver.polled_device(), vec![TEST_DEVICE.to_string()]);
    dserver.shutdown();
}

#[tokio::test]
async fn test_externally_triggered_polling() {
    let (dserver, _observer) = start_test_dserver(test_settings());
    dserver
        .add_obj_polling(
            &poll_args(0, TEST_DEVICE, "attribute", "counter"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let names = strings(&["counter"]);
    let err = dserver
        .read_attributes_2(TEST_DEVICE, &names, DevSource::Cache)
        .unwrap_err();
    assert!(matches!(err, DsError::NoDataYet(_)));

    dserver
        .trigger_polling(&obj_args(TEST_DEVICE, "attribute", "counter"))
        .unwrap();
    let values = dserver
        .read_attributes_2(TEST_DEVICE, &names, DevSource::Cache)
        .unwrap();
    assert_eq!(values[0].data, AttrData::Long(vec![1]));

    let status = dserver.dev_poll_status(TEST_DEVICE).unwrap();
    assert!(status[0].contains("Polling externally triggered"));

    dserver
        .add_obj_polling(
            &poll_args(100, TEST_DEVICE, "attribute", "temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();
    let err = dserver
        .trigger_polling(&obj_args(TEST_DEVICE, "attribute", "temperature"))
        .unwrap_err();
    assert!(matches!(err, DsError::NotSupported(_)));
    dserver.shutdown();
}

#[tokio::test]
async fn test_fill_attribute_polling_buffer() {
    let (dserver, _observer) = start_test_dserver(test_settings());
    dserver
        .add_obj_polling(
            &poll_args(0, TEST_DEVICE, "attribute", "temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();

    let now = dserverd::data::now_ms();
    let records: Vec<AttrHistory> = (0..3)
        .map(|i| {
            let mut value =
                AttributeValue::scalar("Temperature", AttrData::Double(vec![i as f64]));
            value.timestamp_ms = now - 300 + i * 100;
            AttrHistory {
                timestamp_ms: value.timestamp_ms,
                attr_failed: false,
                value: Some(value),
                errors: Vec::new(),
            }
        })
        .collect();
    dserver
        .fill_attr_polling_buffer(TEST_DEVICE, "temperature", records)
        .unwrap();

    let history = dserver
        .read_attribute_history_2(TEST_DEVICE, "temperature", 5)
        .unwrap();
    let values: Vec<AttrData> = history
        .into_iter()
        .map(|h| h.value.unwrap().data)
        .collect();
    assert_eq!(
        values,
        vec![
            AttrData::Double(vec![2.0]),
            AttrData::Double(vec![1.0]),
            AttrData::Double(vec![0.0]),
        ]
    );

    let status = dserver.dev_poll_status(TEST_DEVICE).unwrap();
    assert!(status[0].contains("The polling buffer is externally filled in"));

    dserver
        .add_obj_polling(
            &poll_args(100, TEST_DEVICE, "attribute", "counter"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();
    let err = dserver
        .fill_attr_polling_buffer(TEST_DEVICE, "counter", Vec::new())
        .unwrap_err();
    assert!(matches!(err, DsError::NotSupported(_)));
    dserver.shutdown();
}

#[tokio::test]
async fn test_start_stop_polling() {
    let (dserver, mut observer) = start_test_dserver(test_settings());
    assert_eq!(dserver.status(), "The device is ON\nThe polling is ON");
    dserver
        .add_obj_polling(
            &poll_args(50, TEST_DEVICE, "attribute", "temperature"),
            true,
            Duration::ZERO,
            None,
        )
        .unwrap();

    AdminCommand::StopPolling
        .execute(&dserver, None, std::time::Instant::now())
        .unwrap();
    assert_eq!(dserver.status(), "The device is ON\nThe polling is OFF");
    tokio::time::sleep(Duration::from_millis(100)).await;
    observer.read_history();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(observer.read_history().is_empty());

    AdminCommand::StartPolling
        .execute(&dserver, None, std::time::Instant::now())
        .unwrap();
    assert_eq!(dserver.status(), "The device is ON\nThe polling is ON");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!observer.read_history().is_empty());
    dserver.shutdown();
}

#[tokio::test]
async fn test_admin_routes() {
    let app = TestApp::start().await;

    let resp = app
        .send(AddObjPolling {
            argin: poll_args(200, TEST_DEVICE, "attribute", "temperature"),
            client_id: None,
        })
        .await
        .expect("Failed to send request");
    assert_eq!(resp.status(), 200);

    let resp = app
        .send(AddObjPolling {
            argin: poll_args(200, TEST_DEVICE, "attribute", "temperature"),
            client_id: None,
        })
        .await
        .expect("Failed to send request");
    assert_eq!(resp.status(), 409);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "API_AlreadyPolled");

    let resp = app.get("/admin/polled_device").await.unwrap();
    assert_eq!(resp.status(), 200);
    let devices: Vec<String> = resp.json().await.unwrap();
    assert_eq!(devices, vec![TEST_DEVICE.to_string()]);

    let resp = app
        .send(DevPollStatus {
            device: TEST_DEVICE.to_string(),
            client_id: None,
        })
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let status: Vec<String> = resp.json().await.unwrap();
    assert!(status[0].starts_with("Polled attribute name = Temperature"));

    let resp = app.post("/admin/stop_polling").await.unwrap();
    assert_eq!(resp.status(), 200);
    let status: StatusResponse = app.get("/admin/status").await.unwrap().json().await.unwrap();
    assert!(!status.polling);
    assert_eq!(status.status, "The device is ON\nThe polling is OFF");

    let resp = app
        .send(RemObjPolling {
            argin: obj_args(TEST_DEVICE, "attribute", "temperature"),
            client_id: None,
        })
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(app.dserver.pool().workers().is_empty());

    let resp = app
        .send(RemObjPolling {
            argin: obj_args(TEST_DEVICE, "attribute", "temperature"),
            client_id: None,
        })
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "API_DeviceNotPolled");
}

#[tokio::test]
async fn test_admin_request_shape() {
    let app = TestApp::start().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "http://127.0.0.1:{}/admin/add_obj_polling",
            app.port()
        ))
        .json(&serde_json::json!({
            "lvalue": [100],
            "svalue": [TEST_DEVICE, "attribute"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "API_WrongNumberOfArgs");
}

#[tokio::test]
async fn test_discover_and_time() {
    let app = TestApp::start().await;
    let info: DiscoveryInfo = app.get("/discover").await.unwrap().json().await.unwrap();
    assert_eq!(info.devices.len(), 1);
    assert_eq!(info.devices[0].name, TEST_DEVICE);
    assert_eq!(info.devices[0].idl_version, TEST_IDL);
    assert_eq!(info.admin_device, app.dserver.settings().admin_name);

    let resp = app.get("/time").await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["timestamp_ms"].as_u64().unwrap() > 0);
}
