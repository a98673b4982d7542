//! Session-sticky fan-out (spec.md §4.8): messages sharing a session prefix
//! must always land on the same output, even across many distinct pair ids
//! and even when the meta id isn't valid hex.

use std::sync::Arc;
use std::time::Duration;

use wiretap_core::proto::payload_header;
use wiretap_core::testutil::{TestInput, TestOutput};
use wiretap_core::{CoreConfig, Message, PayloadType, SplitMode};
use wiretap_emitter::{Emitter, InputPlugin, Plugins};

fn req(session: u8, pair: i64) -> Message {
    let mut uuid = [0u8; 40];
    uuid[..20].fill(session);
    uuid[20..].fill(b'x');
    Message::new(
        payload_header(PayloadType::Request, &uuid, pair, 0),
        b"GET / HTTP/1.1\r\n\r\n".to_vec(),
    )
}

#[tokio::test]
async fn same_session_always_lands_on_the_same_output() {
    let out_a = TestOutput::new();
    let out_b = TestOutput::new();
    let out_c = TestOutput::new();

    let mut plugins = Plugins::new();
    plugins.add_input(InputPlugin::simple(TestInput::new([
        req(b'1', 0),
        req(b'2', 1),
        req(b'1', 2),
        req(b'3', 3),
        req(b'2', 4),
        req(b'1', 5),
    ])));
    plugins.add_output(out_a.writer());
    plugins.add_output(out_b.writer());
    plugins.add_output(out_c.writer());

    let mut config = CoreConfig::default();
    config.split_output = SplitMode::SessionSticky;
    let emitter = Emitter::start(plugins, Arc::new(config), None, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    emitter.close().await;

    assert_eq!(out_a.len() + out_b.len() + out_c.len(), 6);

    let landed_in = |session: u8| {
        [&out_a, &out_b, &out_c]
            .iter()
            .position(|out| out.messages().iter().any(|m| wiretap_core::proto::payload_id(&m.meta)[0] == session))
    };

    let session_1 = landed_in(b'1').expect("session '1' should have landed somewhere");
    let session_2 = landed_in(b'2').expect("session '2' should have landed somewhere");

    // Every message whose session byte is '1' must have landed in the same output.
    let session_1_count = [&out_a, &out_b, &out_c][session_1]
        .messages()
        .iter()
        .filter(|m| wiretap_core::proto::payload_id(&m.meta)[0] == b'1')
        .count();
    assert_eq!(session_1_count, 3);

    let session_2_count = [&out_a, &out_b, &out_c][session_2]
        .messages()
        .iter()
        .filter(|m| wiretap_core::proto::payload_id(&m.meta)[0] == b'2')
        .count();
    assert_eq!(session_2_count, 2);
}
