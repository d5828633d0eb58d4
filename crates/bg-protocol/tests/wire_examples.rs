/// Wire contract tests: JSON lines as a data source actually emits them must
/// decode into the expected message kinds and normalize into readings.
use bg_protocol::{
    BgRecord, CallbackRegistration, NoiseLevel, Reading, SequenceHint, SourceMessage,
    TrendDirection,
};

#[test]
fn full_bg_data_line_decodes() {
    let line = r#"{"kind":"bg_data","timestamp":1700000000000,"glucose":123.0,
        "direction":"FortyFiveUp","noise":"Light","filtered":118000.0,"unfiltered":121000.0,
        "source":"G6 Native","sensor_battery_level":80,"transmitter_battery_level":-1,
        "raw_data":"42"}"#
        .replace('\n', "");

    let msg = SourceMessage::from_line(&line).unwrap();
    let SourceMessage::BgData(record) = msg else {
        panic!("expected bg_data, got {msg:?}");
    };
    assert_eq!(record.timestamp, 1_700_000_000_000);
    assert_eq!(record.raw_data, Some(SequenceHint::Text("42".to_owned())));

    let reading = Reading::from(record);
    assert_eq!(reading.trend, TrendDirection::FortyFiveUp);
    assert_eq!(reading.noise, NoiseLevel::Light);
    assert_eq!(reading.sensor_battery_percent, Some(80));
    assert_eq!(reading.transmitter_battery_percent, None);
    assert_eq!(reading.source_label, "G6 Native");
    assert_eq!(reading.raw_value, Some(121_000.0));
}

#[test]
fn minimal_bg_data_line_uses_defaults() {
    let msg =
        SourceMessage::from_line(r#"{"kind":"bg_data","timestamp":5,"glucose":99.5}"#).unwrap();
    assert_eq!(msg, SourceMessage::BgData(BgRecord::new(99.5, 5)));

    let SourceMessage::BgData(record) = msg else {
        unreachable!()
    };
    let reading = Reading::from(record);
    assert_eq!(reading.trend, TrendDirection::Unknown);
    assert_eq!(reading.noise, NoiseLevel::Unknown);
    assert!(reading.source_label.is_empty());
    assert!(reading.sequence.is_none());
}

#[test]
fn numeric_raw_data_is_a_number_hint() {
    let msg = SourceMessage::from_line(
        r#"{"kind":"bg_data","timestamp":5,"glucose":99.5,"raw_data":-3}"#,
    )
    .unwrap();
    let SourceMessage::BgData(record) = msg else {
        panic!("expected bg_data");
    };
    assert_eq!(record.raw_data, Some(SequenceHint::from(-3)));
}

#[test]
fn control_messages_use_kind_tag() {
    let register = SourceMessage::RegisterCallback(CallbackRegistration {
        client_id: "bridge-1".to_owned(),
    });
    let line = register.to_line().unwrap();
    assert!(line.ends_with('\n'));
    let json: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(json["kind"], "register_callback");
    assert_eq!(json["client_id"], "bridge-1");

    let latest = SourceMessage::from_line("{\"kind\":\"get_latest\"}\r\n").unwrap();
    assert_eq!(latest, SourceMessage::GetLatest);

    let hb = SourceMessage::from_line(r#"{"kind":"heartbeat","timestamp":77}"#).unwrap();
    assert!(matches!(hb, SourceMessage::Heartbeat(h) if h.timestamp == 77));
}

#[test]
fn missing_required_fields_are_rejected() {
    assert!(SourceMessage::from_line(r#"{"kind":"bg_data","glucose":99.5}"#).is_err());
    assert!(SourceMessage::from_line(r#"{"kind":"bogus"}"#).is_err());
    assert!(SourceMessage::from_line("not json").is_err());
}

#[test]
fn fractional_and_oversized_raw_data_still_decode() {
    for raw in ["145231.5", "18446744073709551615", "-2.5"] {
        let line = format!(
            r#"{{"kind":"bg_data","timestamp":1700000000000,"glucose":120.0,"raw_data":{raw}}}"#
        );
        let msg = SourceMessage::from_line(&line)
            .unwrap_or_else(|e| panic!("raw_data {raw} rejected: {e}"));
        let SourceMessage::BgData(record) = msg else {
            panic!("expected bg_data for raw_data {raw}");
        };
        let hint = record.raw_data.clone().expect("raw_data kept");
        assert!(matches!(hint, SequenceHint::Number(_)), "raw_data {raw}: {hint:?}");
        assert_eq!(hint.as_signed(), None, "raw_data {raw} has no signed reading");

        let reading = Reading::from(record);
        assert_eq!(reading.value, 120.0);
        assert_eq!(reading.sequence, Some(hint));
    }
}

#[test]
fn fractional_raw_data_survives_re_encoding() {
    let line = r#"{"kind":"bg_data","timestamp":9,"glucose":101.0,"raw_data":145231.5}"#;
    let msg = SourceMessage::from_line(line).unwrap();
    let json: serde_json::Value = serde_json::from_str(&msg.to_line().unwrap()).unwrap();
    assert_eq!(json["raw_data"], 145_231.5);
}
