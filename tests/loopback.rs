//! End-to-end: a publisher and a subscriber talking over localhost.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tickwire::cache::Update;
use tickwire::channel::{ChannelListener, PubChannel, PubListener, SubChannel};
use tickwire::codec::{Codec, Field, MsgType, Value};
use tickwire::socket::{ChanCfg, Framer};

struct OpenSignal {
    tx: mpsc::Sender<(String, String, u32)>,
}

impl PubListener for OpenSignal {
    fn on_pub_open(&self, svc: &str, tkr: &str, tag: u32) -> bool {
        self.tx
            .send((svc.to_string(), tkr.to_string(), tag))
            .is_ok()
    }
}

struct ConnSignal {
    tx: mpsc::Sender<(bool, String)>,
}

impl ChannelListener for ConnSignal {
    fn on_connect(&self, up: bool, reason: &str) {
        let _ = self.tx.send((up, reason.to_string()));
    }
}

fn image_fields() -> Vec<Field> {
    vec![
        Field::new(22, Value::Str("IBM".to_string())),
        Field::new(25, Value::Double(185.32)),
        Field::new(66, Value::Int64(1_750_000)),
        Field::new(3, Value::Str("Real-time".to_string())),
    ]
}

fn sub_cfg(port: u16) -> ChanCfg {
    ChanCfg {
        hosts: vec![("127.0.0.1".to_string(), port)],
        user: "looptest".to_string(),
        hb_interval: Duration::from_secs(5),
        ..Default::default()
    }
}

#[test]
fn pub_sub_image_then_update() {
    let (open_tx, open_rx) = mpsc::channel();
    let publisher = PubChannel::bind(
        "127.0.0.1:0",
        ChanCfg::default(),
        Arc::new(OpenSignal { tx: open_tx }),
    )
    .unwrap();
    let port = publisher.local_addr().port();

    let sub = SubChannel::start(sub_cfg(port), Arc::new(tickwire::channel::NullListener));
    let tag = sub.subscribe("IDN", "IBM");

    let (svc, tkr, open_tag) = open_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("open never reached publisher");
    assert_eq!((svc.as_str(), tkr.as_str()), ("IDN", "IBM"));
    assert_eq!(open_tag, tag);

    assert!(publisher.publish("IDN", "IBM", &image_fields(), true));
    assert!(publisher.publish(
        "IDN",
        "IBM",
        &[Field::new(25, Value::Double(185.45))],
        false,
    ));

    // image first: all four fields
    let img = next_data(&sub);
    assert_eq!(img.mt, MsgType::Image);
    assert_eq!(img.fields.len(), 4);
    assert_eq!(img.stream_id, tag);

    // then the conflated update carrying only fid 25
    let upd = next_data(&sub);
    assert_eq!(upd.mt, MsgType::Update);
    assert_eq!(upd.fields.len(), 1);
    assert_eq!(upd.fields[0].fid, 25);
    assert_eq!(upd.fields[0].value, Value::Double(185.45));

    // the cache reflects all four with the updated ask
    let rec = sub.cache().by_name("IDN", "IBM").expect("cached record");
    assert_eq!(rec.n_fields(), 4);
    assert_eq!(rec.get_field(25).unwrap().value, Value::Double(185.45));
    assert_eq!(
        rec.get_field(22).unwrap().value,
        Value::Str("IBM".to_string())
    );

    sub.stop();
    publisher.stop();
}

fn next_data(sub: &Arc<SubChannel>) -> Update {
    for _ in 0..100 {
        if sub.wait(Duration::from_millis(100)) > 0 {
            if let Some(upd) = sub.get_one_upd() {
                if upd.mt == MsgType::Image || upd.mt == MsgType::Update {
                    return upd;
                }
                continue;
            }
        }
    }
    panic!("no data event within 10s");
}

#[test]
fn heartbeat_timeout_disconnects_with_reason() {
    // a server that accepts, reads, and never says a word
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (ping_tx, ping_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let codec = Codec::new(true);
        let mut framer = Framer::new(4096);
        let mut pings = 0u32;
        let mut chunk = [0u8; 4096];
        loop {
            use std::io::Read;
            match conn.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    framer.feed(&chunk[..n]);
                    while let Some(frame) = framer.next_frame() {
                        if let Ok(wm) = codec.decode(&frame) {
                            if wm.hdr.mt == MsgType::Ping {
                                pings += 1;
                            }
                        }
                    }
                }
            }
        }
        let _ = ping_tx.send(pings);
    });

    let (conn_tx, conn_rx) = mpsc::channel();
    let mut cfg = sub_cfg(port);
    cfg.hb_interval = Duration::from_secs(1);
    let sub = SubChannel::start(cfg, Arc::new(ConnSignal { tx: conn_tx }));

    let (up, _) = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(up, "expected connect-up first");

    let (up, reason) = conn_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(!up);
    assert!(
        reason.contains("heartbeat"),
        "unexpected disconnect reason: {}",
        reason
    );

    sub.stop();
    let pings = ping_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(pings >= 1, "subscriber never pinged an idle link");
}
