mod common;

use std::cell::{Cell, RefCell};
use std::convert::Infallible;
use std::rc::Rc;

use common::MockSession;
use embassy_futures::block_on;
use embassy_time::{Duration, Instant};
use embedded_hal::digital::{ErrorType, InputPin};
use myrtio_rpc::input::ButtonEdge;
use myrtio_rpc::rpc::{RpcClient, RpcTopics};
use myrtio_rpc::runtime::{PublishOutbox, SessionModule, TopicCollector};
use myrtio_rpc::{DriverConfig, MqttRuntime, Publish, SessionState, TelemetryPublisher, Value};

/// A pull-up input; setting it to `true` holds the button down.
#[derive(Clone, Default)]
struct Pin(Rc<Cell<bool>>);

impl ErrorType for Pin {
    type Error = Infallible;
}

impl InputPin for Pin {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(!self.0.get())
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(self.0.get())
    }
}

type Rpc = RpcClient<Box<dyn FnOnce(Value<'_>)>, Box<dyn FnOnce()>, 5>;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Button 1 uploads telemetry, button 2 client attributes, button 3 asks the
/// server for the time.
struct Panel {
    buttons: [ButtonEdge<Pin>; 3],
    uploads: TelemetryPublisher,
    rpc: Rpc,
    log: Rc<RefCell<Vec<String>>>,
}

impl SessionModule for Panel {
    fn register(&self, collector: &mut dyn TopicCollector) {
        self.uploads.register(collector);
        self.rpc.register(collector);
    }

    fn on_message(&mut self, msg: &Publish<'_>) {
        self.rpc.on_message(msg);
    }

    fn on_expire(&mut self, now: Instant) {
        self.rpc.on_expire(now);
    }

    fn on_tick(&mut self, now: Instant, outbox: &mut dyn PublishOutbox) -> Duration {
        let [telemetry, attributes, time] = &mut self.buttons;
        if telemetry.pressed().unwrap() {
            self.uploads
                .send_telemetry(outbox, &[("temperature", Value::Float(23.5))])
                .unwrap();
        }
        if attributes.pressed().unwrap() {
            self.uploads
                .send_attributes(outbox, &[("batteryLevel", Value::Int(87))])
                .unwrap();
        }
        if time.pressed().unwrap() {
            let (on_reply, on_timeout) = (self.log.clone(), self.log.clone());
            self.rpc
                .request(
                    outbox,
                    now,
                    "getCurrentTime",
                    &[],
                    Box::new(move |result: Value<'_>| {
                        on_reply.borrow_mut().push(format!("time {:?}", result.as_i64()));
                    }),
                    Some(Box::new(move || on_timeout.borrow_mut().push("timeout".to_owned()))),
                    Duration::from_secs(10),
                )
                .unwrap();
        }
        POLL_INTERVAL
    }

    fn on_start(&mut self, now: Instant, outbox: &mut dyn PublishOutbox) {
        self.uploads.on_start(now, outbox);
        self.rpc.on_start(now, outbox);
    }

    fn on_stop(&mut self) {
        self.uploads.on_stop();
        self.rpc.on_stop();
    }
}

fn ms(ms: u64) -> Instant {
    Instant::from_millis(ms)
}

#[test]
fn three_button_flow() {
    let pins: [Pin; 3] = Default::default();
    let log = Rc::new(RefCell::new(Vec::new()));
    let panel = Panel {
        buttons: pins.clone().map(ButtonEdge::new),
        uploads: TelemetryPublisher::default(),
        rpc: Rpc::new(RpcTopics::default()),
        log: log.clone(),
    };
    let config = DriverConfig::default();
    assert!(config.min_tick_interval <= POLL_INTERVAL);
    let mut runtime: MqttRuntime<'_, _, _, 2> = MqttRuntime::new(MockSession::default(), panel, config).unwrap();

    block_on(async {
        runtime.step(ms(0)).await;
        assert_eq!(runtime.step(ms(0)).await, SessionState::Connected);

        // a 50 ms tap on button 1
        pins[0].0.set(true);
        runtime.step(ms(50)).await;
        pins[0].0.set(false);
        runtime.step(ms(100)).await;

        // button 2 held across several polls counts once
        pins[1].0.set(true);
        for t in [150, 200, 250] {
            runtime.step(ms(t)).await;
        }
        pins[1].0.set(false);
        runtime.step(ms(300)).await;

        // ticks are due every 50 ms, so a step in between polls nothing
        pins[2].0.set(true);
        runtime.step(ms(320)).await;
        assert!(runtime.session().published_to("v1/devices/me/rpc").is_empty());
        runtime.step(ms(350)).await;
        pins[2].0.set(false);
    });

    let published = &runtime.session().published;
    assert_eq!(published.len(), 3);
    assert_eq!(
        published[0],
        ("v1/devices/me/telemetry".to_owned(), br#"{"temperature":23.5}"#.to_vec())
    );
    assert_eq!(
        published[1],
        ("v1/devices/me/attributes".to_owned(), br#"{"batteryLevel":87}"#.to_vec())
    );
    let (topic, payload) = &published[2];
    let id = topic.strip_prefix("v1/devices/me/rpc/request/").unwrap().to_owned();
    assert_eq!(
        String::from_utf8(payload.clone()).unwrap(),
        format!(r#"{{"id":{},"method":"getCurrentTime","params":{{}}}}"#, id)
    );

    block_on(async {
        let reply = format!("v1/devices/me/rpc/response/{}", id);
        runtime.session_mut().deliver(&reply, r#"{"result":1700000000}"#);
        runtime.step(ms(400)).await;
        runtime.step(ms(20_000)).await;
    });
    assert_eq!(*log.borrow(), ["time Some(1700000000)"]);
}
