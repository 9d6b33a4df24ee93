//! End-to-end exercises over a real TCP socket: push, execute, query, and
//! matting against a server bound to an ephemeral port.

use std::sync::Arc;

use image::{GrayImage, Luma, Rgba, RgbaImage};

use layerforge::backend::{ExecutionEpoch, ProcessOptions, BLANK_SIZE};
use layerforge::matting::ThresholdSegmenter;
use layerforge::protocol::{ErrorCode, Request, Response};
use layerforge::sync::{ConnectionState, ServerState, SyncClient, SyncError, SyncServer};

fn start_server() -> (Arc<ServerState>, String) {
    let state = Arc::new(ServerState::new(
        Box::new(ThresholdSegmenter),
        std::env::temp_dir().join("layerforge-e2e-outputs"),
    ));
    let server = SyncServer::bind("127.0.0.1:0", Arc::clone(&state)).unwrap();
    let addr = server.local_addr().unwrap().to_string();
    server.spawn();
    (state, addr)
}

fn gradient(w: u32, h: u32) -> RgbaImage {
    RgbaImage::from_fn(w, h, |x, y| Rgba([(x * 16) as u8, (y * 16) as u8, 0, 255]))
}

#[test]
fn push_then_execute_delivers_the_pushed_pixels() {
    let (state, addr) = start_server();
    let mut client = SyncClient::new(addr);

    // Execution before any push: deterministic blank placeholder.
    let (img, mask) = state.backend.process_canvas(
        ProcessOptions::default(),
        "42",
        None,
        None,
        &state.transfers,
        ExecutionEpoch::now(),
    );
    assert_eq!((img.width, img.height), (BLANK_SIZE, BLANK_SIZE));
    assert!(img.data.iter().all(|&v| v == 0.0));
    assert_eq!((mask.width, mask.height), (BLANK_SIZE, BLANK_SIZE));

    // Push a composite over the wire.
    let pushed = gradient(8, 8);
    let pushed_mask = GrayImage::from_pixel(8, 8, Luma([200]));
    client.push_canvas("42", &pushed, Some(&pushed_mask)).unwrap();
    assert_eq!(client.state(), ConnectionState::Open);

    // The next execution consumes it.
    let epoch = ExecutionEpoch::now();
    let (img, mask) = state.backend.process_canvas(
        ProcessOptions::default(),
        "42",
        None,
        None,
        &state.transfers,
        epoch,
    );
    assert_eq!((img.width, img.height), (8, 8));
    // Pixel (1, 0) has r = 16.
    assert!((img.data[3] - 16.0 / 255.0).abs() < 1e-6);
    assert!((mask.data[0] - 200.0 / 255.0).abs() < 1e-6);

    // Same epoch: cached, no recomputation, transfer store untouched.
    let (again, _) = state.backend.process_canvas(
        ProcessOptions::default(),
        "42",
        None,
        None,
        &state.transfers,
        epoch,
    );
    assert_eq!(again, img);
    assert!(state.transfers.is_empty());

    // A later epoch with no new push still serves the persisted pair, not
    // the blank placeholder.
    let (later, _) = state.backend.process_canvas(
        ProcessOptions::default(),
        "42",
        None,
        None,
        &state.transfers,
        ExecutionEpoch::now(),
    );
    assert_eq!(later, img);
}

#[test]
fn canvas_data_query_returns_the_cached_composite() {
    let (state, addr) = start_server();
    let mut client = SyncClient::new(addr);

    client.push_canvas("7", &gradient(4, 4), None).unwrap();
    state.backend.process_canvas(
        ProcessOptions::default(),
        "7",
        None,
        None,
        &state.transfers,
        ExecutionEpoch::now(),
    );

    let resp = client
        .request(&Request::GetCanvasData { node_id: "7".to_string() })
        .unwrap();
    match resp {
        Response::CanvasData { success, data } => {
            assert!(success);
            let uri = data.image.expect("cached image present");
            let img = layerforge::encode::decode_image_data_uri(&uri).unwrap();
            assert_eq!(img, gradient(4, 4));
            assert!(data.mask.is_some());
        }
        other => panic!("unexpected response: {:?}", other),
    }

    // A node that never executed is a normal empty result.
    let resp = client
        .request(&Request::GetCanvasData { node_id: "never".to_string() })
        .unwrap();
    match resp {
        Response::CanvasData { success, data } => {
            assert!(success);
            assert!(data.image.is_none());
            assert!(data.mask.is_none());
        }
        other => panic!("unexpected response: {:?}", other),
    }
}

#[test]
fn push_without_node_id_is_acked_as_error() {
    let (state, addr) = start_server();
    let mut client = SyncClient::new(addr);

    let resp = client
        .request(&Request::Push { node_id: String::new(), image: None, mask: None })
        .unwrap();
    match resp {
        Response::Ack { status, message, .. } => {
            assert_eq!(status, "error");
            assert!(message.is_some());
        }
        other => panic!("unexpected response: {:?}", other),
    }
    assert!(state.transfers.is_empty());

    // The connection survived the rejected push.
    client.push_canvas("ok", &gradient(2, 2), None).unwrap();
    assert_eq!(state.transfers.len(), 1);
}

#[test]
fn matting_over_the_wire_and_busy_rejection() {
    let (state, addr) = start_server();
    let mut client = SyncClient::new(addr);

    let checker = RgbaImage::from_fn(4, 4, |x, y| {
        if (x + y) % 2 == 0 {
            Rgba([255, 255, 255, 255])
        } else {
            Rgba([0, 0, 0, 255])
        }
    });
    let uri = layerforge::encode::encode_rgba_data_uri(&checker).unwrap();

    let resp = client
        .request(&Request::Matting { image: uri.clone(), threshold: 0.5 })
        .unwrap();
    match resp {
        Response::MattingResult { matted_image, alpha_mask } => {
            let mask = layerforge::encode::decode_mask_data_uri(&alpha_mask).unwrap();
            assert_eq!(mask.get_pixel(0, 0)[0], 255);
            assert_eq!(mask.get_pixel(1, 0)[0], 0);
            let matted = layerforge::encode::decode_image_data_uri(&matted_image).unwrap();
            assert_eq!(matted.get_pixel(1, 0).0, [0, 0, 0, 0]);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    // While the gate is held, requests are rejected as busy, not queued.
    let _held = state.matting_gate.try_enter().unwrap();
    let resp = client
        .request(&Request::Matting { image: uri, threshold: 0.5 })
        .unwrap();
    match resp {
        Response::Error { code, .. } => assert_eq!(code, ErrorCode::Busy),
        other => panic!("unexpected response: {:?}", other),
    }
}

#[test]
fn load_image_request_distinguishes_failure_kinds() {
    let (_state, addr) = start_server();
    let mut client = SyncClient::new(addr);

    let dir = std::env::temp_dir().join("layerforge-e2e-load");
    std::fs::create_dir_all(&dir).unwrap();
    let txt = dir.join("readme.txt");
    std::fs::write(&txt, b"text").unwrap();
    let png = dir.join("pic.png");
    gradient(5, 7).save(&png).unwrap();

    let cases = [
        (txt.display().to_string(), false, "extension"),
        (dir.join("missing.png").display().to_string(), false, "not found"),
        (png.display().to_string(), true, ""),
    ];

    for (path, expect_success, expect_fragment) in cases {
        let resp = client.request(&Request::LoadImage { path }).unwrap();
        match resp {
            Response::LoadedImage { success, image, width, height, error } => {
                assert_eq!(success, expect_success);
                if expect_success {
                    assert_eq!((width, height), (5, 7));
                    assert!(image.unwrap().starts_with("data:image/png;base64,"));
                } else {
                    let msg = error.unwrap().to_ascii_lowercase();
                    assert!(msg.contains(expect_fragment), "error was: {}", msg);
                }
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}

#[test]
fn client_gives_up_after_repeated_connection_failures() {
    // Bind and immediately drop a listener to get a port nothing listens on.
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let mut client = SyncClient::new(format!("127.0.0.1:{}", port));

    let err = client
        .request(&Request::GetCanvasData { node_id: "x".to_string() })
        .unwrap_err();
    assert!(matches!(err, SyncError::GaveUp));
    assert_eq!(client.state(), ConnectionState::GaveUp);

    // Once given up, the client fails fast instead of retrying.
    let start = std::time::Instant::now();
    let err = client
        .request(&Request::GetCanvasData { node_id: "x".to_string() })
        .unwrap_err();
    assert!(matches!(err, SyncError::GaveUp));
    assert!(start.elapsed() < std::time::Duration::from_millis(100));
}
