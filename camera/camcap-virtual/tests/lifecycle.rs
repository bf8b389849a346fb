use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use test_log::test;

use camcap::{
    AcquireFailure, CaptureClient, ConfigStatus, ControlId, ControlList, Error, PixelFormat,
    SessionState, Size, StreamRole, SupportedFormat,
    video::{GrabEnd, GrabOptions, VideoCapture, VideoProperties, grab_frames},
};
use camcap_virtual::{VirtualCameraSpec, VirtualModule, VirtualVideoCapture};

const CAM0: &str = "/base/virtual/camera0";

fn fast_module() -> VirtualModule {
    VirtualModule::with_cameras(vec![VirtualCameraSpec::new(CAM0).with_fps(200)])
}

#[test]
fn empty_device_list_is_no_device_found() {
    let client = CaptureClient::new(VirtualModule::empty());
    assert!(client.list_devices().unwrap().is_empty());
    let err = client.first_device().unwrap_err();
    assert!(matches!(err, Error::NoDeviceFound));
    assert_eq!(err.to_string(), "no camera found");
}

#[test]
fn first_device_is_acquired_exactly_once() {
    let module = fast_module();
    let client = CaptureClient::new(module.clone());
    let device = client.first_device().unwrap();
    assert_eq!(device.id, CAM0);

    let mut session = client.acquire(&device).unwrap();
    assert_eq!(session.state(), SessionState::Acquired);
    assert!(module.is_acquired(CAM0));

    // The same client holds one session at a time.
    match client.acquire(&device) {
        Err(Error::AcquireFailed { reason, .. }) => assert_eq!(reason, AcquireFailure::AlreadyInUse),
        other => panic!("unexpected {:?}", other.map(|s| s.state())),
    }
    // Another client sees the device lock held by the module.
    let other_client = CaptureClient::new(module.clone());
    match other_client.acquire(&device) {
        Err(Error::AcquireFailed { reason, .. }) => assert_eq!(reason, AcquireFailure::AlreadyInUse),
        other => panic!("unexpected {:?}", other.map(|s| s.state())),
    }

    session.release().unwrap();
    assert_eq!(session.state(), SessionState::Released);
    assert!(!module.is_acquired(CAM0));

    let mut again = client.acquire(&device).unwrap();
    again.release().unwrap();
}

#[test]
fn unknown_device_is_not_found() {
    let client = CaptureClient::new(fast_module());
    match client.acquire_by_id("/base/virtual/missing") {
        Err(Error::AcquireFailed { reason, .. }) => assert_eq!(reason, AcquireFailure::NotFound),
        other => panic!("unexpected {:?}", other.map(|s| s.state())),
    }
    // A failed acquire does not hold the client's slot.
    let mut session = client.acquire_by_id(CAM0).unwrap();
    session.release().unwrap();
}

#[test]
fn double_release_is_invalid_state() {
    let client = CaptureClient::new(fast_module());
    let mut session = client.acquire_by_id(CAM0).unwrap();
    session.release().unwrap();
    match session.release() {
        Err(Error::InvalidState { operation, state }) => {
            assert_eq!(operation, "release");
            assert_eq!(state, SessionState::Released);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn supported_request_is_kept_exactly() {
    let client = CaptureClient::new(fast_module());
    let session = client.acquire_by_id(CAM0).unwrap();
    let validated = session
        .negotiate(
            StreamRole::Viewfinder,
            Some(Size::new(1280, 720)),
            Some("BGR888".parse().unwrap()),
        )
        .unwrap();
    assert_eq!(validated.status(), ConfigStatus::Valid);
    assert_eq!(validated.config().size, Size::new(1280, 720));
    assert_eq!(validated.config().pixel_format, PixelFormat::BGR888);
    assert_eq!(validated.config().to_string(), "1280x720-BGR888");
}

#[test]
fn unsupported_request_is_adjusted_to_nearest() {
    let spec = VirtualCameraSpec::new(CAM0).with_formats(vec![SupportedFormat {
        pixel_format: PixelFormat::XRGB8888,
        sizes: vec![Size::new(640, 480), Size::new(1296, 972)],
    }]);
    let client = CaptureClient::new(VirtualModule::with_cameras(vec![spec]));
    let session = client.acquire_by_id(CAM0).unwrap();
    let validated = session
        .negotiate(
            StreamRole::Viewfinder,
            Some(Size::new(1280, 720)),
            Some(PixelFormat::BGR888),
        )
        .unwrap();
    assert_eq!(validated.status(), ConfigStatus::Adjusted);
    assert_eq!(validated.config().size, Size::new(1296, 972));
    assert_eq!(validated.config().pixel_format, PixelFormat::XRGB8888);

    // The adjusted configuration validates unchanged.
    let again = session.validate(validated.config().clone()).unwrap();
    assert_eq!(again.status(), ConfigStatus::Valid);
    assert_eq!(again.config(), validated.config());
}

#[test]
fn no_formats_is_configuration_unsupported() {
    let spec = VirtualCameraSpec::new(CAM0).with_formats(vec![SupportedFormat {
        pixel_format: PixelFormat::BGR888,
        sizes: vec![],
    }]);
    let client = CaptureClient::new(VirtualModule::with_cameras(vec![spec]));
    let session = client.acquire_by_id(CAM0).unwrap();
    let mut config = camcap::StreamConfiguration {
        role: StreamRole::Viewfinder,
        size: Size::new(1, 1),
        pixel_format: PixelFormat::BGR888,
        stride: 0,
        frame_size: 0,
        buffer_count: 1,
        buffer_bounds: camcap::BufferCountBounds { min: 1, max: 1 },
        formats: vec![],
    };
    config.update_geometry();
    let err = session.validate(config).unwrap_err();
    assert!(matches!(err, Error::ConfigurationUnsupported(_)));
}

#[test]
fn applying_twice_is_idempotent() {
    let client = CaptureClient::new(fast_module());
    let mut session = client.acquire_by_id(CAM0).unwrap();
    let validated = session
        .negotiate(StreamRole::Viewfinder, None, None)
        .unwrap();
    session.apply(&validated).unwrap();
    let first = session.configuration().unwrap().clone();
    session.apply(&validated).unwrap();
    assert_eq!(session.configuration().unwrap(), &first);
    assert_eq!(session.state(), SessionState::Configured);
    session.release().unwrap();
}

#[test]
fn out_of_order_operations_are_rejected() {
    let client = CaptureClient::new(fast_module());
    let mut session = client.acquire_by_id(CAM0).unwrap();

    assert!(matches!(
        session.allocate_buffers(),
        Err(Error::InvalidState {
            state: SessionState::Acquired,
            ..
        })
    ));
    assert!(matches!(
        session.start(),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        session.create_request(),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        session.run_for(Duration::from_millis(1)),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(session.stop(), Err(Error::InvalidState { .. })));

    let validated = session
        .negotiate(StreamRole::Viewfinder, None, None)
        .unwrap();
    session.apply(&validated).unwrap();
    session.allocate_buffers().unwrap();

    // A request can be created but not submitted before capture starts.
    let request = session.create_request().unwrap();
    assert!(matches!(
        session.submit(request),
        Err(Error::InvalidState {
            operation: "submit",
            state: SessionState::BuffersAllocated
        })
    ));
    // Configuration is frozen once buffers exist.
    assert!(matches!(
        session.apply(&validated),
        Err(Error::InvalidState { .. })
    ));

    session.release().unwrap();
    assert!(matches!(
        session.negotiate(StreamRole::Viewfinder, None, None),
        Err(Error::InvalidState {
            state: SessionState::Released,
            ..
        })
    ));
}

#[test]
fn full_lifecycle_resubmits_completed_requests() {
    let client = CaptureClient::new(fast_module());
    let device = client.first_device().unwrap();
    let mut session = client.acquire(&device).unwrap();
    let validated = session
        .negotiate(StreamRole::Viewfinder, Some(Size::new(640, 480)), None)
        .unwrap();
    session.apply(&validated).unwrap();
    let buffers = session.allocate_buffers().unwrap();
    assert_eq!(buffers, 4);

    session.start().unwrap();
    assert_eq!(session.state(), SessionState::Capturing);
    assert_eq!(session.in_flight(), buffers);

    let stats = session.run_for(Duration::from_millis(300)).unwrap();
    // 200 fps for 300 ms, with generous slack for slow machines.
    assert!(stats.completed > 10, "completed {}", stats.completed);
    // Every completion was resubmitted immediately.
    assert_eq!(stats.submitted, stats.completed + buffers as u64);
    assert_eq!(session.in_flight(), buffers);

    session.stop().unwrap();
    let stats = session.stats();
    assert_eq!(stats.cancelled, buffers as u64);
    assert_eq!(session.in_flight(), 0);
    // Cancelled requests are not resubmitted.
    assert_eq!(stats.submitted, stats.completed + stats.cancelled);

    session.release().unwrap();
}

#[test]
fn completions_are_bounded_by_submissions() {
    let client = CaptureClient::new(fast_module());
    let mut session = client.acquire_by_id(CAM0).unwrap();
    let validated = session
        .negotiate(StreamRole::Viewfinder, None, None)
        .unwrap();
    session.apply(&validated).unwrap();
    session.allocate_buffers().unwrap();
    // A consumer which never reads: every frame after the first two is
    // dropped, but its buffer is still requeued.
    let frames = session.frames(2).unwrap();
    session.start().unwrap();
    let stats = session.run_for(Duration::from_millis(200)).unwrap();
    assert!(stats.completed <= stats.submitted);
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.dropped, stats.completed - 2);
    // Two buffers are held by undelivered frames.
    assert_eq!(session.in_flight(), 2);

    drop(frames);
    session.release().unwrap();
}

#[test]
fn consumer_frames_return_buffers_to_the_pool() {
    let client = CaptureClient::new(fast_module());
    let mut session = client.acquire_by_id(CAM0).unwrap();
    let validated = session
        .negotiate(StreamRole::StillCapture, Some(Size::new(640, 480)), Some(PixelFormat::BGR888))
        .unwrap();
    session.apply(&validated).unwrap();
    session.allocate_buffers().unwrap();

    let mut controls = ControlList::default();
    controls.set(ControlId::Brightness, 0.0);
    session.set_default_controls(controls);

    let frames = session.frames(8).unwrap();
    session.start().unwrap();

    let consumer = std::thread::spawn(move || {
        let mut seen = Vec::new();
        for frame in frames.iter() {
            assert_eq!(frame.bytes_used(), 640 * 480 * 3);
            assert_eq!(frame.data()[0], frame.sequence() as u8);
            seen.push(frame.sequence());
            // dropping the frame returns its buffer
        }
        seen
    });

    let stats = session.run_for(Duration::from_millis(300)).unwrap();
    session.stop().unwrap();
    let seen = consumer.join().unwrap();

    assert!(stats.delivered > 10, "delivered {}", stats.delivered);
    assert_eq!(seen.len() as u64, session.stats().delivered);
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "sequence is increasing");

    session.release().unwrap();
}

#[test]
fn brightness_control_offsets_frame_content() {
    let client = CaptureClient::new(fast_module());
    let mut session = client.acquire_by_id(CAM0).unwrap();
    let validated = session
        .negotiate(StreamRole::Viewfinder, Some(Size::new(640, 480)), None)
        .unwrap();
    session.apply(&validated).unwrap();
    session.allocate_buffers().unwrap();

    let mut controls = ControlList::default();
    controls.set(ControlId::Brightness, 0.5);
    session.set_default_controls(controls);

    let frames = session.frames(8).unwrap();
    session.start().unwrap();
    let consumer = std::thread::spawn(move || {
        let mut count = 0;
        for frame in frames.iter() {
            // 0.5 * 127 truncates to 63.
            assert_eq!(frame.data()[0], (frame.sequence() as u8).wrapping_add(63));
            count += 1;
        }
        count
    });

    session.run_for(Duration::from_millis(200)).unwrap();
    session.stop().unwrap();
    let count = consumer.join().unwrap();
    assert!(count > 0);
    assert_eq!(count, session.stats().delivered);
    session.release().unwrap();
}

#[test]
fn dropped_requests_return_their_buffers() {
    let client = CaptureClient::new(fast_module());
    let mut session = client.acquire_by_id(CAM0).unwrap();
    let validated = session
        .negotiate(StreamRole::Viewfinder, None, None)
        .unwrap();
    session.apply(&validated).unwrap();
    let buffers = session.allocate_buffers().unwrap();
    assert_eq!(buffers, 4);

    // Dropped before the start: the buffer is queued with the others.
    let request = session.create_request().unwrap();
    drop(request);
    session.start().unwrap();
    assert_eq!(session.in_flight(), buffers);

    session.run_for(Duration::from_millis(50)).unwrap();
    assert_eq!(session.in_flight(), buffers);

    // Every buffer is on the device, none left for a new request.
    assert!(matches!(
        session.create_request(),
        Err(Error::NoBufferAvailable)
    ));

    session.stop().unwrap();
    assert_eq!(session.in_flight(), 0);
    assert_eq!(session.stats().cancelled, buffers as u64);
    session.release().unwrap();
}

#[test]
fn event_loop_exits_after_duration() {
    // A camera so slow that no frame arrives during the loop.
    let spec = VirtualCameraSpec::new(CAM0).with_fps(1);
    let client = CaptureClient::new(VirtualModule::with_cameras(vec![spec]));
    let mut session = client.acquire_by_id(CAM0).unwrap();
    let validated = session
        .negotiate(StreamRole::Viewfinder, None, None)
        .unwrap();
    session.apply(&validated).unwrap();
    session.allocate_buffers().unwrap();
    session.start().unwrap();

    let duration = Duration::from_millis(250);
    let start = Instant::now();
    let stats = session.run_for(duration).unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= duration);
    assert!(elapsed < duration + Duration::from_millis(500));
    assert_eq!(stats.completed, 0);
    session.release().unwrap();
}

#[test]
fn dropping_a_session_releases_the_camera() {
    let module = fast_module();
    let client = CaptureClient::new(module.clone());
    {
        let mut session = client.acquire_by_id(CAM0).unwrap();
        let validated = session
            .negotiate(StreamRole::Viewfinder, None, None)
            .unwrap();
        session.apply(&validated).unwrap();
        session.allocate_buffers().unwrap();
        session.start().unwrap();
    }
    assert!(!module.is_acquired(CAM0));
    let mut session = client.acquire_by_id(CAM0).unwrap();
    session.release().unwrap();
}

#[test]
fn snapshot_of_a_captured_frame() -> camcap::Result<()> {
    let client = CaptureClient::new(fast_module());
    let mut session = client.acquire_by_id(CAM0)?;
    let validated = session.negotiate(
        StreamRole::Viewfinder,
        Some(Size::new(640, 480)),
        Some(PixelFormat::BGR888),
    )?;
    session.apply(&validated)?;
    session.allocate_buffers()?;
    let frames = session.frames(1)?;
    session.start()?;
    session.run_for(Duration::from_millis(100))?;
    session.stop()?;

    let frame = frames.try_recv().expect("one frame delivered");
    let tempdir = tempfile::tempdir()?;
    let path = tempdir.path().join("snapshot.png");
    frame.save_snapshot(&path)?;
    assert!(path.exists());
    drop(frame);

    session.release()?;
    Ok(())
}

#[test]
fn video_capture_loop_ends_on_retrieval_failure() {
    let mut cap = VirtualVideoCapture::new().with_frame_budget(5);
    let effective = cap
        .apply_properties(&VideoProperties {
            width: 1600,
            height: 900,
            fps: 60,
            fourcc: PixelFormat::from_fourcc(*b"BGR3"),
        })
        .unwrap();
    assert_eq!((effective.width, effective.height), (1600, 900));

    let mut frames = 0;
    let summary = grab_frames(&mut cap, &GrabOptions::default(), |frame| {
        assert_eq!(frame.cols, 1600);
        assert_eq!(frame.elem_size, 3);
        frames += 1;
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(frames, 5);
    assert_eq!(summary.frames, 5);
    assert!(matches!(summary.end, GrabEnd::RetrievalFailed(_)));
}
