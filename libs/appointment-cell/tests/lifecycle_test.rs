mod common;

use assert_matches::assert_matches;
use chrono::Duration;

use appointment_cell::error::AppointmentError;
use appointment_cell::models::{
    AppointmentStatus, AuditAction, NotificationType, APPOINTMENTS_TABLE,
};
use appointment_cell::services::verify_chain;

use common::{admin, booking_for, patient, slot, specialist, Harness};

#[tokio::test]
async fn test_cancelled_slot_can_be_booked_again() {
    let h = Harness::new();
    let ana = patient("Ana Ruiz");
    let luis = patient("Luis Marin");
    let at = slot(10, 14, 0);

    let first = h.service.create_appointment(booking_for(&ana, at), &ana).await.unwrap();
    assert_eq!(first.status, AppointmentStatus::Booked);

    let second = h.service.create_appointment(booking_for(&luis, at), &luis).await;
    assert_matches!(second, Err(AppointmentError::SlotUnavailable));

    h.service
        .change_status(first.id, AppointmentStatus::Cancelled, &ana)
        .await
        .unwrap();

    let third = h.service.create_appointment(booking_for(&luis, at), &luis).await.unwrap();
    assert_eq!(third.scheduled_at, at);
    assert_eq!(h.gateway.appointments().await.len(), 2);
}

#[tokio::test]
async fn test_patient_blocked_inside_window_but_specialist_is_not() {
    let h = Harness::new();
    let ana = patient("Ana Ruiz");
    let at = common::start() + Duration::hours(2);

    let booked = h.service.create_appointment(booking_for(&ana, at), &ana).await.unwrap();

    let by_patient = h.service.change_status(booked.id, AppointmentStatus::Cancelled, &ana).await;
    assert_matches!(by_patient, Err(AppointmentError::TooLateToCancel { window_hours: 24 }));

    let cancelled = h
        .service
        .change_status(booked.id, AppointmentStatus::Cancelled, &specialist())
        .await
        .unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
}

#[tokio::test]
async fn test_completed_appointment_is_closed() {
    let h = Harness::new();
    let ana = patient("Ana Ruiz");
    let doctor = specialist();
    let booked = h.service.create_appointment(booking_for(&ana, slot(10, 14, 0)), &ana).await.unwrap();

    h.service.change_status(booked.id, AppointmentStatus::Completed, &doctor).await.unwrap();

    let update = appointment_cell::models::ClinicalUpdate {
        specialist_notes: Some("Follow-up in six weeks".to_string()),
        ..Default::default()
    };
    assert_matches!(
        h.service.record_clinical_update(booked.id, update, &doctor).await,
        Err(AppointmentError::AppointmentClosed)
    );
    assert_matches!(
        h.service.reschedule_appointment(booked.id, slot(11, 9, 0), &doctor).await,
        Err(AppointmentError::NotReschedulable(AppointmentStatus::Completed))
    );
}

#[tokio::test]
async fn test_protected_window_boundary() {
    let at = slot(10, 14, 0);

    for (elapsed_before, patient_ok) in [
        (Duration::hours(24) + Duration::seconds(1), true),
        (Duration::hours(23) + Duration::minutes(59) + Duration::seconds(59), false),
    ] {
        let h = Harness::new();
        let ana = patient("Ana Ruiz");
        let cancel_me = h.service.create_appointment(booking_for(&ana, at), &ana).await.unwrap();
        let move_me = h
            .service
            .create_appointment(booking_for(&ana, at + Duration::minutes(30)), &ana)
            .await
            .unwrap();

        h.clock.set(at - elapsed_before);

        let cancel = h.service.change_status(cancel_me.id, AppointmentStatus::Cancelled, &ana).await;
        // Window for the second appointment is measured from its own start
        h.clock.set(move_me.scheduled_at - elapsed_before);
        let reschedule = h.service.reschedule_appointment(move_me.id, slot(12, 9, 0), &ana).await;

        if patient_ok {
            assert!(cancel.is_ok(), "cancel at {:?} before should succeed", elapsed_before);
            assert!(reschedule.is_ok());
        } else {
            assert_matches!(cancel, Err(AppointmentError::TooLateToCancel { .. }));
            assert_matches!(reschedule, Err(AppointmentError::TooLateToReschedule { .. }));

            // Staff are exempt at the same instant
            h.service.reschedule_appointment(move_me.id, slot(12, 9, 0), &admin()).await.unwrap();
            h.clock.set(at - elapsed_before);
            h.service.change_status(cancel_me.id, AppointmentStatus::Cancelled, &specialist()).await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_status_never_returns_to_booked() {
    let h = Harness::new();
    let ana = patient("Ana Ruiz");
    let doctor = specialist();

    let cancelled = h.service.create_appointment(booking_for(&ana, slot(10, 14, 0)), &ana).await.unwrap();
    h.service.change_status(cancelled.id, AppointmentStatus::Cancelled, &ana).await.unwrap();

    let completed = h.service.create_appointment(booking_for(&ana, slot(10, 15, 0)), &ana).await.unwrap();
    h.service.change_status(completed.id, AppointmentStatus::Completed, &doctor).await.unwrap();

    for id in [cancelled.id, completed.id] {
        for target in [AppointmentStatus::Booked, AppointmentStatus::Cancelled, AppointmentStatus::Completed] {
            assert_matches!(
                h.service.change_status(id, target, &doctor).await,
                Err(AppointmentError::InvalidTransition { .. })
            );
        }
    }

    assert_matches!(
        h.service.reschedule_appointment(cancelled.id, slot(11, 9, 0), &doctor).await,
        Err(AppointmentError::NotReschedulable(AppointmentStatus::Cancelled))
    );
}

#[tokio::test]
async fn test_patient_cannot_complete_own_appointment() {
    let h = Harness::new();
    let ana = patient("Ana Ruiz");
    let booked = h.service.create_appointment(booking_for(&ana, slot(10, 14, 0)), &ana).await.unwrap();

    assert_matches!(
        h.service.change_status(booked.id, AppointmentStatus::Completed, &ana).await,
        Err(AppointmentError::InvalidTransition { from: AppointmentStatus::Booked, to: AppointmentStatus::Completed })
    );
}

#[tokio::test]
async fn test_reschedule_onto_taken_and_own_slot() {
    let h = Harness::new();
    let ana = patient("Ana Ruiz");
    let luis = patient("Luis Marin");
    let a = h.service.create_appointment(booking_for(&ana, slot(10, 14, 0)), &ana).await.unwrap();
    let b = h.service.create_appointment(booking_for(&luis, slot(10, 15, 0)), &luis).await.unwrap();

    assert_matches!(
        h.service.reschedule_appointment(a.id, b.scheduled_at, &ana).await,
        Err(AppointmentError::SlotUnavailable)
    );

    let same = h.service.reschedule_appointment(a.id, a.scheduled_at, &ana).await.unwrap();
    assert_eq!(same.scheduled_at, a.scheduled_at);
    assert_eq!(same.status, AppointmentStatus::Booked);
}

#[tokio::test]
async fn test_every_mutation_is_audited_with_post_state() {
    let h = Harness::new();
    let ana = patient("Ana Ruiz");
    let doctor = specialist();

    let booked = h.service.create_appointment(booking_for(&ana, slot(10, 14, 0)), &ana).await.unwrap();
    let moved = h.service.reschedule_appointment(booked.id, slot(11, 10, 30), &ana).await.unwrap();
    let done = h.service.change_status(booked.id, AppointmentStatus::Completed, &doctor).await.unwrap();

    let events = h.gateway.audit_events().await;
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.table == APPOINTMENTS_TABLE && e.record_id == booked.id));

    assert_eq!(events[0].action, AuditAction::Insert);
    assert!(events[0].before.is_none());
    assert_eq!(events[0].actor_display_name, "Ana Ruiz");

    assert_eq!(events[1].before.as_ref().unwrap()["scheduled_at"], serde_json::to_value(booked.scheduled_at).unwrap());
    assert_eq!(events[1].after["scheduled_at"], serde_json::to_value(moved.scheduled_at).unwrap());

    assert_eq!(events[2].before.as_ref().unwrap()["status"], "booked");
    assert_eq!(events[2].after["status"], "completed");
    assert_eq!(events[2].actor_id, doctor.id);
    assert_eq!(events[2].after["updated_at"], serde_json::to_value(done.updated_at).unwrap());

    assert_eq!(verify_chain(&events), Ok(()));
}

#[tokio::test]
async fn test_notifications_follow_committed_changes() {
    let h = Harness::new();
    let ana = patient("Ana Ruiz");
    let booked = h.service.create_appointment(booking_for(&ana, slot(10, 14, 0)), &ana).await.unwrap();
    h.notifier.wait_for(1).await;
    h.service.reschedule_appointment(booked.id, slot(11, 9, 0), &ana).await.unwrap();
    h.notifier.wait_for(2).await;
    h.service.change_status(booked.id, AppointmentStatus::Cancelled, &ana).await.unwrap();

    let events = h.notifier.wait_for(3).await;
    let kinds: Vec<NotificationType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![NotificationType::Booked, NotificationType::Rescheduled, NotificationType::Cancelled]);

    assert_eq!(events[1].old_time, Some(slot(10, 14, 0)));
    assert_eq!(events[1].new_time, slot(11, 9, 0));
    assert!(events.iter().all(|e| e.patient_id == ana.id.unwrap() && e.appointment_id == booked.id));
}

#[tokio::test]
async fn test_completion_sends_no_notification() {
    let h = Harness::new();
    let ana = patient("Ana Ruiz");
    let booked = h.service.create_appointment(booking_for(&ana, slot(10, 14, 0)), &ana).await.unwrap();
    assert_eq!(h.notifier.wait_for(1).await.len(), 1);
    h.service.change_status(booked.id, AppointmentStatus::Completed, &specialist()).await.unwrap();

    // Give any stray dispatch a chance to land
    assert_eq!(h.notifier.wait_for(2).await.len(), 1);
}

#[tokio::test]
async fn test_off_grid_and_past_slots_are_rejected() {
    let h = Harness::new();
    let ana = patient("Ana Ruiz");

    assert_matches!(
        h.service.create_appointment(booking_for(&ana, slot(10, 14, 10)), &ana).await,
        Err(AppointmentError::Validation(_))
    );
    assert_matches!(
        h.service.create_appointment(booking_for(&ana, common::start() - Duration::hours(1)), &ana).await,
        Err(AppointmentError::Validation(_))
    );

    let booked = h.service.create_appointment(booking_for(&ana, slot(10, 14, 0)), &ana).await.unwrap();
    assert_matches!(
        h.service.reschedule_appointment(booked.id, slot(11, 9, 15), &ana).await,
        Err(AppointmentError::Validation(_))
    );
    assert_eq!(h.gateway.audit_events().await.len(), 1);
}

#[tokio::test]
async fn test_patients_only_touch_their_own_appointments() {
    let h = Harness::new();
    let ana = patient("Ana Ruiz");
    let luis = patient("Luis Marin");

    assert_matches!(
        h.service.create_appointment(booking_for(&ana, slot(10, 14, 0)), &luis).await,
        Err(AppointmentError::Forbidden(_))
    );

    let booked = h.service.create_appointment(booking_for(&ana, slot(10, 14, 0)), &admin()).await.unwrap();
    assert_eq!(h.service.get_appointment(booked.id, &ana).await.unwrap().id, booked.id);
    assert_matches!(h.service.get_appointment(booked.id, &luis).await, Err(AppointmentError::Forbidden(_)));
    assert_matches!(
        h.service.change_status(booked.id, AppointmentStatus::Cancelled, &luis).await,
        Err(AppointmentError::Forbidden(_))
    );
    assert_matches!(
        h.service.reschedule_appointment(booked.id, slot(12, 9, 0), &luis).await,
        Err(AppointmentError::Forbidden(_))
    );
}

#[tokio::test]
async fn test_unknown_appointment_is_not_found() {
    let h = Harness::new();
    let missing = uuid::Uuid::new_v4();

    assert_matches!(h.service.get_appointment(missing, &admin()).await, Err(AppointmentError::NotFound));
    assert_matches!(
        h.service.change_status(missing, AppointmentStatus::Cancelled, &admin()).await,
        Err(AppointmentError::NotFound)
    );
    assert_matches!(
        h.service.reschedule_appointment(missing, slot(12, 9, 0), &admin()).await,
        Err(AppointmentError::NotFound)
    );
}
