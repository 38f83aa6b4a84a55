use std::{sync::Arc, time::Duration};

use color_eyre::Result;
use meter_eol::{
    events::Topic,
    jobs::MeterStatus,
    meter::MeterInfo,
    mock::{MockMeter, MockTransport},
    robot::{ButtonAction, ButtonPress},
    shared::{DeviceResult, JobResult, JobStatus},
    store::JobStore,
};
use pretty_assertions::assert_eq;
use serde_json::json;

mod common;
use common::*;

/// Make the mocked printer answer every ticket with `result`.
fn printer_replies(meter: &MockMeter, transport: &MockTransport, result: &'static str) {
    let transport = transport.clone();
    meter.on_trigger(move |device| {
        if device == "printer" {
            transport.send(METER, &journal("IPSBusDevSendPrintMessageVA: ticket 1"));
            transport.send(
                METER,
                &journal(&format!("PRINT_TICKET_REPLY: id=1 result={result}")),
            );
        }
        Ok(())
    });
}

#[tokio::test]
async fn printed_tickets_pass() -> Result<()> {
    let rig = rig();
    printer_replies(&rig.meter, &rig.transport, "SUCCEEDED");

    let (accepted, message) =
        rig.registry
            .start_job(METER, "cycle_print", kwargs(json!({"count": 2, "delay": 0.1})));
    assert!(accepted, "{message}");
    assert_eq!(rig.registry.meter_status(METER), MeterStatus::Busy);

    finish(&rig).await?;

    let status = rig.registry.job_status(METER);
    assert_eq!(status.status, JobStatus::Finished);
    assert_eq!(status.result, Some(JobResult::Pass));
    assert_eq!(rig.meter.triggers(), vec!["printer", "printer"]);

    let shared = rig.registry.shared(METER).unwrap();
    assert_eq!(shared.device_result("printer"), Some(DeviceResult::Pass));
    assert!(shared
        .logs()
        .iter()
        .any(|line| line.contains("PRINT_TICKET_REPLY")));

    Ok(())
}

#[tokio::test]
async fn missing_reply_faults_and_stops_the_job() -> Result<()> {
    let rig = rig();
    let transport = rig.transport.clone();
    rig.meter.on_trigger(move |_| {
        transport.send(METER, &journal("IPSBusDevSendPrintMessageVA: ticket 1"));
        Ok(())
    });

    let (accepted, _) = rig.registry.start_job(
        METER,
        "cycle_print",
        kwargs(json!({
            "count": 5,
            "delay": 2.0,
            "monitors": [["printer", {"timeout_s": 0.2}]],
        })),
    );
    assert!(accepted);

    finish(&rig).await?;

    let status = rig.registry.job_status(METER);
    assert_eq!(status.status, JobStatus::Finished);
    assert_eq!(status.result, Some(JobResult::Fail));

    // Stopped on the first ticket.
    assert_eq!(rig.meter.triggers().len(), 1);

    let shared = rig.registry.shared(METER).unwrap();
    assert_eq!(shared.device_result("printer"), Some(DeviceResult::Fail));
    assert!(shared.logs().iter().any(|line| line.contains("[FAULT]")));

    Ok(())
}

#[tokio::test]
async fn pending_ticket_fails() -> Result<()> {
    let rig = rig();
    printer_replies(&rig.meter, &rig.transport, "PENDING");

    let (accepted, _) =
        rig.registry
            .start_job(METER, "cycle_print", kwargs(json!({"count": 1, "delay": 0.5})));
    assert!(accepted);

    finish(&rig).await?;

    assert_eq!(rig.registry.job_status(METER).result, Some(JobResult::Fail));

    Ok(())
}

#[tokio::test]
async fn one_job_per_meter() -> Result<()> {
    let rig = rig();

    let (accepted, _) =
        rig.registry
            .start_job(METER, "cycle_coin_shutter", kwargs(json!({"count": 1, "delay": 0.3})));
    assert!(accepted);

    let (accepted, message) = rig.registry.start_job(METER, "dummy", kwargs(json!({})));
    assert!(!accepted);
    assert_eq!(message, "job already running");

    finish(&rig).await?;

    let (accepted, message) = rig.registry.start_job(METER, "dummy", kwargs(json!({})));
    assert!(accepted, "{message}");
    finish(&rig).await?;

    Ok(())
}

#[tokio::test]
async fn stopping_twice_keeps_the_job_cancelled() -> Result<()> {
    let rig = rig();

    let (accepted, _) =
        rig.registry
            .start_job(METER, "cycle_coin_shutter", kwargs(json!({"count": 100, "delay": 1.0})));
    assert!(accepted);

    rig.transport.wait_for_listener(METER).await;

    assert!(rig.registry.stop_job(METER).await);
    assert!(rig.registry.stop_job(METER).await);

    finish(&rig).await?;

    let status = rig.registry.job_status(METER);
    assert_eq!(status.status, JobStatus::Cancelled);
    assert_eq!(status.result, Some(JobResult::Fail));

    let shared = rig.registry.shared(METER).unwrap();
    let cancels = shared
        .logs()
        .iter()
        .filter(|line| line.contains("JOB CANCELLED BY USER"))
        .count();
    assert_eq!(cancels, 1);

    // Once for the cancel, once for the end of the job.
    assert_eq!(rig.meter.beeps(), vec![3, 3]);

    // Idle again, stopping is harmless.
    assert!(rig.registry.stop_job(METER).await);
    assert_eq!(rig.registry.meter_status(METER), MeterStatus::Ready);

    Ok(())
}

#[tokio::test]
async fn finished_jobs_are_stored() -> Result<()> {
    let rig = rig();
    let mut events = rig.registry.events().subscribe();

    let (accepted, _) = rig
        .registry
        .start_job(METER, "dummy", kwargs(json!({"operator": "kim"})));
    assert!(accepted);
    finish(&rig).await?;

    let jobs = rig.store.jobs(7);
    assert_eq!(jobs.len(), 1);

    let job = &jobs[0];
    assert_eq!(job.record.name, "dummy");
    assert_eq!(job.record.status, JobResult::Pass);
    assert_eq!(job.record.data["kwargs"]["operator"], "kim");
    assert!(job.log.contains("=== JOB SUMMARY ==="));

    let mut topics = vec![];
    while let Ok(event) = events.try_recv() {
        topics.push(event.topic);
    }
    // The closing status may still be on its way.
    assert_eq!(topics[..3], [Topic::Status, Topic::Devices, Topic::Job]);

    Ok(())
}

#[tokio::test]
async fn meters_without_db_id_are_not_stored() -> Result<()> {
    let rig = rig();
    rig.registry
        .add_meter(Arc::new(MockMeter::new("10.0.0.2", MeterInfo::default())));

    let (accepted, _) = rig.registry.start_job("10.0.0.2", "dummy", kwargs(json!({})));
    assert!(accepted);
    tokio::time::timeout(Duration::from_secs(10), rig.registry.wait("10.0.0.2")).await?;

    assert_eq!(rig.registry.job_status("10.0.0.2").result, Some(JobResult::Pass));
    assert!(rig.store.jobs(7).is_empty());

    Ok(())
}

#[tokio::test]
async fn unreachable_log_is_an_error() -> Result<()> {
    let rig = rig();
    rig.transport.set_unreachable(METER);

    let (accepted, _) =
        rig.registry
            .start_job(METER, "cycle_print", kwargs(json!({"count": 1, "delay": 0.1})));
    assert!(accepted);
    finish(&rig).await?;

    let status = rig.registry.job_status(METER);
    assert_eq!(status.status, JobStatus::Error);
    assert_eq!(status.result, Some(JobResult::Fail));
    assert!(status.last_error.unwrap().contains("unreachable"));

    // The routine never ran.
    assert!(rig.meter.triggers().is_empty());

    Ok(())
}

#[tokio::test]
async fn burn_in_skips_untested_and_missing_devices() -> Result<()> {
    let rig = rig();

    let (accepted, _) = rig.registry.start_job(
        METER,
        "all tests",
        kwargs(json!({"printer": 1, "numBurnDelay": 0.0})),
    );
    assert!(accepted);
    finish(&rig).await?;

    let shared = rig.registry.shared(METER).unwrap();
    assert_eq!(shared.device_result("printer"), Some(DeviceResult::Missing));
    assert_eq!(shared.device_result("nfc"), Some(DeviceResult::NotApplicable));
    assert_eq!(
        shared.device_result("screen test"),
        Some(DeviceResult::NotApplicable)
    );

    let status = rig.registry.job_status(METER);
    assert_eq!(status.result, Some(JobResult::Pass));
    assert_eq!(status.current_program.as_deref(), Some("all tests"));

    Ok(())
}

#[tokio::test]
async fn store_trait_is_usable_directly() -> Result<()> {
    let rig = rig();
    let store: &dyn JobStore = rig.store.as_ref();

    store
        .insert(
            3,
            meter_eol::store::JobRecord {
                name: "cycle_nfc".into(),
                status: JobResult::Fail,
                data: json!({}),
            },
            "log".into(),
        )
        .await?;

    assert_eq!(rig.store.jobs(3).len(), 1);

    Ok(())
}

#[tokio::test]
async fn keypad_test_passes_once_every_key_is_pressed() -> Result<()> {
    let rig = rig();
    let transport = rig.transport.clone();
    rig.meter.on_trigger(move |device| {
        if device == "keypad" {
            for key in ["help", "up", "down", "cancel", "accept", "max"] {
                transport.send(METER, &key_press(key));
            }
        }
        Ok(())
    });

    let (accepted, message) = rig.registry.start_job(
        METER,
        "keypad",
        kwargs(json!({"monitors": [["keypad", {"layouts": ["1x6"]}]]})),
    );
    assert!(accepted, "{message}");
    finish(&rig).await?;

    let status = rig.registry.job_status(METER);
    assert_eq!(status.status, JobStatus::Finished);
    assert_eq!(status.result, Some(JobResult::Pass));

    let shared = rig.registry.shared(METER).unwrap();
    assert_eq!(shared.device_result("keypad"), Some(DeviceResult::Pass));
    assert_eq!(shared.device_meta()["layouts_done"], json!(["1x6"]));

    Ok(())
}

#[tokio::test]
async fn idle_keypad_fails() -> Result<()> {
    let rig = rig();
    let transport = rig.transport.clone();
    rig.meter.on_trigger(move |_| {
        transport.send(METER, &key_press("help"));
        Ok(())
    });

    let (accepted, _) = rig.registry.start_job(
        METER,
        "test_keypad",
        kwargs(json!({
            "monitors": [["keypad", {"layouts": ["1x6"], "inactivity_timeout_s": 0.1}]],
        })),
    );
    assert!(accepted);
    finish(&rig).await?;

    assert_eq!(rig.registry.job_status(METER).result, Some(JobResult::Fail));
    let shared = rig.registry.shared(METER).unwrap();
    assert_eq!(shared.device_result("keypad"), Some(DeviceResult::Fail));

    Ok(())
}

fn robot_monitors(per_button_timeout_s: f64) -> serde_json::Value {
    json!([["robot_keypad", {
        "buttons": ["1", "2"],
        "poll_interval_ms": 10,
        "per_button_timeout_s": per_button_timeout_s,
    }]])
}

#[tokio::test]
async fn robot_presses_seen_by_the_meter_pass() -> Result<()> {
    let rig = rig();
    let transport = rig.transport.clone();
    let robot = rig.robot.clone();
    rig.meter.on_trigger(move |_| {
        let transport = transport.clone();
        let robot = robot.clone();
        tokio::spawn(async move {
            for button in ["1", "2"] {
                robot.push(ButtonPress {
                    button_name: button.into(),
                    action: ButtonAction::Pressing,
                });
                tokio::time::sleep(Duration::from_millis(50)).await;
                transport.send(METER, &key_press(button));

                // Longer than a button may take, so a watch left armed would fault.
                tokio::time::sleep(Duration::from_millis(400)).await;
            }
        });
        Ok(())
    });

    let (accepted, message) = rig.registry.start_job(
        METER,
        "test_robot_keypad",
        kwargs(json!({"monitors": robot_monitors(0.2)})),
    );
    assert!(accepted, "{message}");
    finish(&rig).await?;

    let status = rig.registry.job_status(METER);
    assert_eq!(status.result, Some(JobResult::Pass));

    let shared = rig.registry.shared(METER).unwrap();
    assert_eq!(shared.device_result("robot_keypad"), Some(DeviceResult::Pass));
    assert!(!shared.logs().iter().any(|line| line.contains("[FAULT]")));

    Ok(())
}

#[tokio::test]
async fn robot_press_missing_from_the_log_fails() -> Result<()> {
    let rig = rig();
    let robot = rig.robot.clone();
    rig.meter.on_trigger(move |_| {
        robot.push(ButtonPress {
            button_name: "1".into(),
            action: ButtonAction::Pressing,
        });
        Ok(())
    });

    let (accepted, _) = rig.registry.start_job(
        METER,
        "test_robot_keypad",
        kwargs(json!({"monitors": robot_monitors(0.1)})),
    );
    assert!(accepted);
    finish(&rig).await?;

    assert_eq!(rig.registry.job_status(METER).result, Some(JobResult::Fail));

    let shared = rig.registry.shared(METER).unwrap();
    assert_eq!(shared.device_result("robot_keypad"), Some(DeviceResult::Fail));
    assert!(shared
        .logs()
        .iter()
        .any(|line| line.contains("[FAULT] robot_keypad")));

    Ok(())
}

#[tokio::test]
async fn burn_in_only_listens_to_the_device_under_test() -> Result<()> {
    let rig = rig_with(meter_info("ms3", &["PRINTER", "COIN_SHUTTER"]));
    let transport = rig.transport.clone();
    rig.meter.on_trigger(move |device| {
        match device {
            // Unanswered, and a fault if the printer's monitor were listening.
            "coin shutter" => {
                transport.send(METER, &journal("IPSBusDevSendPrintMessageVA: stray ticket"))
            }
            "printer" => {
                transport.send(METER, &journal("IPSBusDevSendPrintMessageVA: ticket 1"));
                transport.send(METER, &journal("PRINT_TICKET_REPLY: id=1 result=SUCCEEDED"));
            }
            _ => {}
        }
        Ok(())
    });

    let (accepted, _) = rig.registry.start_job(
        METER,
        "all tests",
        kwargs(json!({
            "coin shutter": 1,
            "printer": 1,
            "delay": 0.3,
            "numBurnDelay": 0.0,
            "monitors": [["printer", {"timeout_s": 0.1}]],
        })),
    );
    assert!(accepted);
    finish(&rig).await?;

    let shared = rig.registry.shared(METER).unwrap();
    assert_eq!(shared.device_result("coin shutter"), Some(DeviceResult::Pass));
    assert_eq!(shared.device_result("printer"), Some(DeviceResult::Pass));
    assert_eq!(shared.device_result("modem"), Some(DeviceResult::NotApplicable));

    let logs = shared.logs();
    assert!(logs.iter().any(|line| line.contains("[SUPPRESS][printer]")));
    assert!(!logs.iter().any(|line| line.contains("[FAULT]")));

    assert_eq!(rig.registry.job_status(METER).result, Some(JobResult::Pass));
    assert_eq!(rig.meter.triggers(), vec!["coin shutter", "printer"]);

    Ok(())
}

#[tokio::test]
async fn lost_log_is_an_error() -> Result<()> {
    let rig = rig();
    let transport = rig.transport.clone();
    rig.meter.on_trigger(move |_| {
        transport.send(METER, &journal("IPSBusDevSendPrintMessageVA: ticket 1"));
        transport.hang_up(METER);
        Ok(())
    });

    let (accepted, _) = rig.registry.start_job(
        METER,
        "cycle_print",
        kwargs(json!({"count": 1, "delay": 2.0})),
    );
    assert!(accepted);
    finish(&rig).await?;

    let status = rig.registry.job_status(METER);
    assert_eq!(status.status, JobStatus::Error);
    assert_eq!(status.result, Some(JobResult::Fail));
    assert!(status.last_error.unwrap().contains("Log stream ended"));

    let shared = rig.registry.shared(METER).unwrap();
    assert_eq!(shared.device_result("printer"), Some(DeviceResult::Fail));

    Ok(())
}

#[tokio::test]
async fn crashing_routine_frees_the_meter() -> Result<()> {
    let rig = rig();
    rig.meter.on_trigger(|_| panic!("meter exploded"));

    let (accepted, _) = rig.registry.start_job(
        METER,
        "cycle_coin_shutter",
        kwargs(json!({"count": 1})),
    );
    assert!(accepted);
    finish(&rig).await?;

    let status = rig.registry.job_status(METER);
    assert_eq!(status.status, JobStatus::Error);
    assert_eq!(status.result, Some(JobResult::Fail));
    assert_eq!(rig.registry.meter_status(METER), MeterStatus::Ready);

    let (accepted, message) = rig.registry.start_job(METER, "dummy", kwargs(json!({})));
    assert!(accepted, "{message}");
    finish(&rig).await?;

    Ok(())
}
