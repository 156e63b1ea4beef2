use crate::CallFrame;
use crate::Error;
use crate::Fault;
use crate::HubFrame;
use crate::MethodId;
use crate::Status;

#[test]
fn test_hub_frames_survive_the_envelope() -> anyhow::Result<()> {
    let frames = vec![
        HubFrame::Request {
            method_id: MethodId(42),
            correlation_id: Some(7),
            payload: vec![1, 2, 3],
        },
        HubFrame::Request {
            method_id: MethodId(42),
            correlation_id: None,
            payload: Vec::new(),
        },
        HubFrame::Fault {
            correlation_id: u32::MAX,
            fault: Fault::new(Status::NotFound, "no such room"),
        },
        HubFrame::Close { reason: None },
    ];

    for frame in frames {
        let bytes = frame.encode()?;
        assert_eq!(HubFrame::decode(&bytes)?, frame);
    }
    Ok(())
}

#[test]
fn test_completion_ids() {
    let response = HubFrame::Response {
        correlation_id: 9,
        payload: vec![],
    };
    let push = HubFrame::Push {
        method_id: MethodId(9),
        payload: vec![],
    };
    assert_eq!(response.completes(), Some(9));
    assert_eq!(push.completes(), None);
}

#[test]
fn test_truncated_frame_is_an_error() {
    let bytes = HubFrame::Push {
        method_id: MethodId(1),
        payload: b"hello".to_vec(),
    }
    .encode()
    .unwrap();

    let err = HubFrame::decode(&bytes[..bytes.len() - 2]).unwrap_err();
    assert!(matches!(err, Error::Codec(hubpack::Error::Binary(_))));
}

#[test]
fn test_call_frame_unexpected() {
    let frame = CallFrame::HalfClose;
    assert_eq!(
        frame.unexpected("Open"),
        Error::UnexpectedFrame {
            expected: "Open",
            found: "HalfClose"
        }
    );
}

#[test]
fn test_fault_display_and_codes() {
    let fault = Fault::internal("std::io::Error", "disk on fire");
    assert_eq!(fault.status, Status::Internal);
    assert_eq!(fault.to_string(), "internal: std::io::Error: disk on fire");

    for code in 1..=16 {
        let status = Status::from_code(code).unwrap();
        assert_eq!(status.code(), code);
    }
    assert_eq!(Status::from_code(0), None);
    assert!(Fault::session_closed().is_session_closed());
    assert!(!Fault::session_closing().is_session_closed());
}

#[test]
fn test_fault_json_shape() {
    let json = serde_json::to_value(Fault::new(Status::PermissionDenied, "nope")).unwrap();
    assert_eq!(json["status"], "PermissionDenied");
    assert_eq!(json["detail"], "nope");
}
