use std::{sync::Arc, time::Duration};

use color_eyre::Result;
use meter_eol::{
    error::Error,
    events::Events,
    listener::Listener,
    meter::MeterInfo,
    mock::MockTransport,
    monitor::{self, printer::PrinterConfig, MonitorContext, MonitorSpec},
    shared::{DeviceResult, FlushPolicy, SharedState},
};
use pretty_assertions::assert_eq;
use tokio::{sync::oneshot, task::JoinHandle, time::timeout};

mod common;
use common::{journal, METER};

fn shared() -> Arc<SharedState> {
    Arc::new(SharedState::new(
        METER,
        Events::default(),
        FlushPolicy::default(),
    ))
}

/// Start a listener with a fast printer monitor, returning once it tails the mock log.
async fn listen(
    shared: &Arc<SharedState>,
    transport: &MockTransport,
) -> Result<JoinHandle<meter_eol::error::Result<()>>> {
    let context = MonitorContext {
        meter: MeterInfo::default(),
        shared: shared.clone(),
        robot: None,
    };
    let printer = monitor::build(
        &MonitorSpec::Printer(PrinterConfig { timeout_s: 0.1 }),
        &context,
    )?;

    let (tx, rx) = oneshot::channel();
    let listener = Listener::new(shared.clone(), METER, "mock", vec![printer])
        .poll_interval(Duration::from_millis(5))
        .on_connected(tx);

    let transport = transport.clone();
    let handle = tokio::spawn(async move { listener.run(&transport).await });

    timeout(Duration::from_secs(5), rx).await??;

    Ok(handle)
}

#[tokio::test]
async fn fault_stops_the_job() -> Result<()> {
    let shared = shared();
    let transport = MockTransport::new();
    shared.set_allowed(["printer"], "test");
    shared.set_current_device(Some("printer"));

    let handle = listen(&shared, &transport).await?;
    transport.send(METER, &journal("IPSBusDevSendPrintMessageVA: ticket"));

    // Nothing replies, so the watch expires and the listener stops by itself.
    timeout(Duration::from_secs(5), handle).await???;

    assert!(shared.stop.is_set());
    assert_eq!(shared.device_result("printer"), Some(DeviceResult::Fail));
    assert!(shared
        .logs()
        .iter()
        .any(|line| line.contains("[FAULT] printer")));

    Ok(())
}

#[tokio::test]
async fn monitors_not_allowed_are_suppressed() -> Result<()> {
    let shared = shared();
    let transport = MockTransport::new();
    shared.set_allowed(["modem"], "test");

    let handle = listen(&shared, &transport).await?;
    transport.send(METER, &journal("IPSBusDevSendPrintMessageVA: ticket"));

    // Well past the printer's timeout.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!shared.stop.is_set());

    shared.end_listener.set();
    timeout(Duration::from_secs(5), handle).await???;

    let logs = shared.logs();
    assert!(logs.iter().any(|line| line.contains("[SUPPRESS][printer]")));
    assert!(!logs.iter().any(|line| line.contains("[FAULT]")));
    assert_eq!(shared.device_result("printer"), None);

    Ok(())
}

#[tokio::test]
async fn lines_are_logged_and_noise_is_not() -> Result<()> {
    let shared = shared();
    let transport = MockTransport::new();

    let handle = listen(&shared, &transport).await?;
    transport.send(METER, &journal("Door opened"));
    transport.send(METER, &journal("TimerLib:TimerSetTimer:12: Set ref=3"));
    transport.send(METER, "not a log line at all {");

    tokio::time::sleep(Duration::from_millis(100)).await;
    shared.end_listener.set();
    timeout(Duration::from_secs(5), handle).await???;

    let logs = shared.logs();
    assert!(logs.iter().any(|line| line.ends_with(" Door opened")));
    assert!(!logs.iter().any(|line| line.contains("TimerSetTimer")));
    assert!(!logs.iter().any(|line| line.contains("not a log line")));
    assert!(logs
        .last()
        .is_some_and(|line| line.ends_with("End of listener loop")));

    Ok(())
}

#[tokio::test]
async fn unreachable_log_stops_the_job() -> Result<()> {
    let shared = shared();
    let transport = MockTransport::new();
    transport.set_unreachable(METER);

    let listener = Listener::new(shared.clone(), METER, "mock", vec![]);
    let result = timeout(Duration::from_secs(5), listener.run(&transport)).await?;

    assert!(result.is_err());
    assert!(shared.stop.is_set());

    Ok(())
}

#[tokio::test]
async fn lost_log_stops_the_job() -> Result<()> {
    let shared = shared();
    let transport = MockTransport::new();
    shared.set_allowed(["printer"], "test");

    let handle = listen(&shared, &transport).await?;
    transport.send(METER, &journal("IPSBusDevSendPrintMessageVA: ticket"));
    transport.hang_up(METER);

    let result = timeout(Duration::from_secs(5), handle).await??;

    assert!(matches!(result, Err(Error::Transport(_))));
    assert!(shared.stop.is_set());
    assert!(shared
        .logs()
        .iter()
        .any(|line| line.contains("Log stream ended, stopping job")));

    Ok(())
}

#[tokio::test]
async fn broken_log_stops_the_job() -> Result<()> {
    let shared = shared();
    let transport = MockTransport::new();

    let handle = listen(&shared, &transport).await?;
    transport.fail(METER, "connection reset");

    let result = timeout(Duration::from_secs(5), handle).await??;

    assert!(matches!(result, Err(Error::Transport(_))));
    assert!(shared.stop.is_set());
    assert!(shared
        .logs()
        .iter()
        .any(|line| line.contains("connection reset")));

    Ok(())
}

#[tokio::test]
async fn log_ending_after_the_job_is_fine() -> Result<()> {
    let shared = shared();
    let transport = MockTransport::new();

    let handle = listen(&shared, &transport).await?;
    shared.end_listener.set();
    transport.hang_up(METER);

    timeout(Duration::from_secs(5), handle).await???;
    assert!(!shared.stop.is_set());

    Ok(())
}
