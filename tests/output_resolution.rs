// Output resolution against hand-built resource snapshots.
//
// Each snapshot mirrors what a real card reports: connectors with their modes and
// encoder lists, encoders with possible-CRTC masks, CRTC ids in resource order.

use scanout::{
    DisplayError, ErrorKind,
    backend::kms::output::{
        ConnectorSnapshot, EncoderSnapshot, OutputMode, ResourceSnapshot, resolve_output,
    },
    config::ModeRequest,
};

fn mode(width: u16, height: u16, refresh: u32, preferred: bool) -> OutputMode {
    OutputMode {
        name: format!("{width}x{height}"),
        width,
        height,
        refresh,
        preferred,
        kernel: None,
    }
}

fn laptop_card(modes: Vec<OutputMode>) -> ResourceSnapshot {
    ResourceSnapshot {
        connectors: vec![
            ConnectorSnapshot {
                id: 77,
                name: "DP-1".into(),
                connected: false,
                current_encoder: None,
                encoders: vec![21],
                modes: Vec::new(),
            },
            ConnectorSnapshot {
                id: 78,
                name: "eDP-1".into(),
                connected: true,
                current_encoder: None,
                encoders: vec![20],
                modes,
            },
        ],
        encoders: vec![
            EncoderSnapshot {
                id: 20,
                crtc: None,
                possible_crtcs: 0b0110,
            },
            EncoderSnapshot {
                id: 21,
                crtc: None,
                possible_crtcs: 0b0001,
            },
        ],
        crtcs: vec![50, 51, 52, 53],
    }
}

#[test]
fn preferred_mode_beats_larger_mode() {
    let snapshot = laptop_card(vec![mode(1920, 1080, 60, false), mode(1280, 720, 60, true)]);

    let selection = resolve_output(&snapshot, None).unwrap();
    assert_eq!(selection.connector_index, 1);
    assert_eq!((selection.mode.width, selection.mode.height), (1280, 720));
    assert!(!selection.mode_fallback);
}

#[test]
fn missing_requested_mode_falls_back_and_succeeds() {
    let snapshot = laptop_card(vec![mode(1920, 1080, 60, false), mode(1280, 720, 60, true)]);
    let request = ModeRequest::parse("1024x768@60", "SCANOUT_MODE").unwrap();

    let selection = resolve_output(&snapshot, Some(&request)).unwrap();
    assert!(selection.mode_fallback);
    assert_eq!(selection.mode.name, "1280x720");
}

#[test]
fn requested_mode_with_rate_is_honoured() {
    let snapshot = laptop_card(vec![
        mode(1920, 1080, 144, true),
        mode(1920, 1080, 60, false),
        mode(1280, 720, 60, false),
    ]);
    let request = ModeRequest::parse("1920x1080@60", "--mode").unwrap();

    let selection = resolve_output(&snapshot, Some(&request)).unwrap();
    assert_eq!(selection.mode_index, 1);
    assert_eq!(selection.mode.refresh, 60);
    assert!(!selection.mode_fallback);
}

#[test]
fn crtc_comes_from_the_connected_connectors_encoder() {
    let snapshot = laptop_card(vec![mode(1920, 1080, 60, true)]);

    let binding = resolve_output(&snapshot, None).unwrap().binding;
    assert_eq!(binding.connector_id, 78);
    assert_eq!(binding.encoder_id, 20);
    // Lowest set bit of 0b0110 is index 1.
    assert_eq!(binding.crtc_index, 1);
    assert_eq!(binding.crtc_id, 51);
}

#[test]
fn unreachable_crtcs_are_reported() {
    let mut snapshot = laptop_card(vec![mode(1920, 1080, 60, true)]);
    snapshot.encoders[0].possible_crtcs = 0b1_0000;

    let err = resolve_output(&snapshot, None).unwrap_err();
    assert!(matches!(err, DisplayError::NoCrtcAvailable));
    assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
}

#[test]
fn nothing_connected_is_reported() {
    let mut snapshot = laptop_card(vec![mode(1920, 1080, 60, true)]);
    snapshot.connectors[1].connected = false;

    let err = resolve_output(&snapshot, None).unwrap_err();
    assert!(matches!(err, DisplayError::NoConnectedOutput));
    assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
}

#[test]
fn connected_without_modes_is_reported() {
    let snapshot = laptop_card(Vec::new());

    let err = resolve_output(&snapshot, None).unwrap_err();
    assert!(matches!(err, DisplayError::NoModeAvailable));
}
