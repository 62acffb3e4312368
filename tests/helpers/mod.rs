//! Helpers for running integration tests.
//!
//! It has to be under `tests/helpers/mod.rs` instead of `tests/helpers.rs`
//! to avoid it from being treated as another test module.

#![allow(dead_code)]

use once_cell::sync::Lazy;
use paste::paste;
use std::future::Future;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use dserverd::data::{
    AttrData, AttrDataType, AttrDim, AttrWriteType, AttributeValue, CmdValue, DevEncoded,
    LongStringArray,
};
use dserverd::devices::{AttrInfo, CmdInfo, DeviceBackend};
use dserverd::dserver::{DServer, PollingSettings};
use dserverd::error::DevError;
use dserverd::properties::{MemoryPropertyStore, PropertyStore};
use dserverd::startup::{init_tracing, start_server_tcp};

pub const TEST_DEVICE: &str = "test/dev/1";
pub const TEST_IDL: u32 = 5;
pub const TEMPERATURE: f64 = 21.5;

static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        init_tracing(std::io::stdout).expect("Failed to initialize tracing");
    } else {
        init_tracing(std::io::sink).expect("Failed to initialize tracing");
    };
});

/// A device whose backend calls can be observed and whose temperature
/// reads can be made to fail.
pub struct TestDevice {
    counter: i32,
    fail_reads: Arc<AtomicBool>,
    reads_tx: UnboundedSender<Vec<String>>,
    commands_tx: UnboundedSender<String>,
}

pub struct TestDeviceObserver {
    fail_reads: Arc<AtomicBool>,
    reads_rx: UnboundedReceiver<Vec<String>>,
    commands_rx: UnboundedReceiver<String>,
}

impl TestDevice {
    pub fn init() -> (Self, TestDeviceObserver) {
        let (reads_tx, reads_rx) = tokio::sync::mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = tokio::sync::mpsc::unbounded_channel();
        let fail_reads = Arc::new(AtomicBool::new(false));

        let device = TestDevice {
            counter: 0,
            fail_reads: fail_reads.clone(),
            reads_tx,
            commands_tx,
        };
        let observer = TestDeviceObserver {
            fail_reads,
            reads_rx,
            commands_rx,
        };
        (device, observer)
    }

    fn read_one(&mut self, name: &str) -> Result<AttributeValue, DevError> {
        let data = match name.to_lowercase().as_str() {
            "temperature" | "fwd" => {
                if self.fail_reads.load(Ordering::SeqCst) {
                    return Err(DevError::new(
                        "TEST_ReadFailed",
                        "Temperature sensor unplugged",
                        "TestDevice::read_attributes",
                    ));
                }
                AttrData::Double(vec![TEMPERATURE])
            }
            "counter" | "auto" => {
                self.counter += 1;
                AttrData::Long(vec![self.counter])
            }
            "wave" => {
                let mut value = AttributeValue::scalar("wave", AttrData::Double(vec![1.0, 2.0]));
                value.r_dim = AttrDim { dim_x: 2, dim_y: 0 };
                return Ok(value);
            }
            "blob" => AttrData::Encoded(vec![DevEncoded {
                format: "raw".to_string(),
                data: vec![1, 2, 3],
            }]),
            _ => {
                return Err(DevError::new(
                    "API_AttrNotFound",
                    format!("Attribute {name} not found"),
                    "TestDevice::read_attributes",
                ))
            }
        };
        Ok(AttributeValue::scalar(name, data))
    }
}

impl DeviceBackend for TestDevice {
    fn commands(&self) -> Vec<CmdInfo> {
        vec![
            CmdInfo::void("GetCounter"),
            CmdInfo::void("Reset"),
            CmdInfo::with_argin("SetValue"),
        ]
    }

    fn attributes(&self) -> Vec<AttrInfo> {
        vec![
            AttrInfo::scalar("Temperature", AttrDataType::DevDouble),
            AttrInfo::scalar("Counter", AttrDataType::DevLong),
            AttrInfo::spectrum("Wave", AttrDataType::DevDouble).writable(AttrWriteType::ReadWrite),
            AttrInfo::scalar("Fwd", AttrDataType::DevDouble).forwarded_to("other/dev/1/temperature"),
            AttrInfo::scalar("Blob", AttrDataType::DevEncoded),
            AttrInfo::scalar("Auto", AttrDataType::DevLong).polled_every(200),
        ]
    }

    fn command_inout(&mut self, name: &str, _argin: &CmdValue) -> Result<CmdValue, DevError> {
        let _ = self.commands_tx.send(name.to_string());
        match name.to_lowercase().as_str() {
            "getcounter" => {
                self.counter += 1;
                Ok(CmdValue::Long(self.counter))
            }
            "reset" => {
                self.counter = 0;
                Ok(CmdValue::Void)
            }
            _ => Ok(CmdValue::Void),
        }
    }

    fn read_attributes(&mut self, names: &[String]) -> Vec<Result<AttributeValue, DevError>> {
        let _ = self.reads_tx.send(names.to_vec());
        names.iter().map(|n| self.read_one(n)).collect()
    }
}

impl TestDeviceObserver {
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Names passed to every backend read call since the last check.
    pub fn read_history(&mut self) -> Vec<Vec<String>> {
        let rx = &mut self.reads_rx;
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    /// Commands executed on the backend since the last check.
    pub fn command_history(&mut self) -> Vec<String> {
        let rx = &mut self.commands_rx;
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }
}

pub fn test_settings() -> PollingSettings {
    PollingSettings::default()
}

/// Build a server context with one test device and a memory store.
pub fn start_test_dserver(settings: PollingSettings) -> (Arc<DServer>, TestDeviceObserver) {
    start_test_dserver_with_store(settings, Arc::new(MemoryPropertyStore::new()), false)
}

pub fn start_test_dserver_with_store(
    settings: PollingSettings,
    store: Arc<dyn PropertyStore>,
    with_db: bool,
) -> (Arc<DServer>, TestDeviceObserver) {
    Lazy::force(&TRACING);

    let dserver = DServer::new(settings, store, with_db).expect("Failed to build server");
    let observer = add_test_device(&dserver, TEST_DEVICE, TEST_IDL);
    (dserver, observer)
}

pub fn add_test_device(dserver: &DServer, name: &str, idl: u32) -> TestDeviceObserver {
    let (device, observer) = TestDevice::init();
    dserver
        .add_device(name, idl, Box::new(device))
        .expect("Failed to add test device");
    observer
}

pub fn poll_args(period: i64, device: &str, kind: &str, name: &str) -> LongStringArray {
    LongStringArray::new(vec![period], vec![device, kind, name])
}

pub fn obj_args(device: &str, kind: &str, name: &str) -> Vec<String> {
    vec![device.to_string(), kind.to_string(), name.to_string()]
}

/// A helper trait for building URLs to send admin requests to.
pub trait DsRequest: serde::Serialize {
    fn build_url(app: &TestApp) -> String;
}

macro_rules! impl_admin_request {
    ($api:ident) => {
        paste! {
            impl DsRequest for dserverd::routes::admin::[<$api:camel>] {
                fn build_url(app: &TestApp) -> String {
                    format!(
                        "http://127.0.0.1:{}/admin/{}",
                        app.port, stringify!([<$api:snake>]),
                    )
                }
            }
        }
    };
}

impl_admin_request!(AddObjPolling);
impl_admin_request!(UpdObjPollingPeriod);
impl_admin_request!(RemObjPolling);
impl_admin_request!(TriggerPolling);
impl_admin_request!(DevPollStatus);

/// A test application that starts a server over TCP and provides helper
/// methods for sending requests and fetching what happened to the fake
/// device.
pub struct TestApp {
    port: u16,
    pub dserver: Arc<DServer>,
    observer: TestDeviceObserver,
}

impl TestApp {
    pub async fn start() -> Self {
        Self::start_with(test_settings()).await
    }

    pub async fn start_with(settings: PollingSettings) -> Self {
        let (dserver, observer) = start_test_dserver(settings);

        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind TCP listener");
        let port = listener.local_addr().unwrap().port();
        let server =
            start_server_tcp(listener, dserver.clone(), 4).expect("Failed to start server");
        let _ = tokio::spawn(async move { server.await });

        TestApp {
            port,
            dserver,
            observer,
        }
    }

    pub fn send<T: DsRequest>(
        &self,
        payload: T,
    ) -> impl Future<Output = Result<reqwest::Response, reqwest::Error>> {
        let client = reqwest::Client::new();
        let url = T::build_url(self);

        client.post(url).json(&payload).send()
    }

    pub fn post_device<T: serde::Serialize>(
        &self,
        device: &str,
        endpoint: &str,
        payload: &T,
    ) -> impl Future<Output = Result<reqwest::Response, reqwest::Error>> {
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/device/{}/{}", self.port, device, endpoint);

        client.post(url).json(payload).send()
    }

    pub fn post(&self, path: &str) -> impl Future<Output = Result<reqwest::Response, reqwest::Error>> {
        let client = reqwest::Client::new();
        client
            .post(format!("http://127.0.0.1:{}{}", self.port, path))
            .send()
    }

    pub fn get(&self, path: &str) -> impl Future<Output = Result<reqwest::Response, reqwest::Error>> {
        let client = reqwest::Client::new();
        client
            .get(format!("http://127.0.0.1:{}{}", self.port, path))
            .send()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn observer(&mut self) -> &mut TestDeviceObserver {
        &mut self.observer
    }
}
