use chrono::{DateTime, TimeDelta, Utc};
use scout_core::lifecycle::SourceStatus;
use scout_core::models::{ExtractedEvent, NewSource};
use scout_core::recipe::{CssFields, CssStrategy, FieldFormat, FieldRule, Pagination, Recipe};
use scout_core::traits::SourceStore;
use scout_core::AppError;
use uuid::Uuid;

use crate::common::setup_test_db;

fn css_recipe() -> Recipe {
    let mut fields = CssFields::new(
        FieldRule::text("h3.title"),
        FieldRule::attr("time", "datetime").with_format(FieldFormat::Iso),
    );
    fields.price = Some(FieldRule::text(".price").with_default("Free"));
    let css = CssStrategy {
        event_container: "div.event".into(),
        fields,
        pagination: Pagination {
            next_selector: Some("a.next".into()),
            max_pages: 2,
        },
    };
    Recipe::css(css, 0.8, "cards in main").unwrap()
}

fn event(title: &str, start: &str) -> ExtractedEvent {
    let start = DateTime::parse_from_rfc3339(start).unwrap();
    ExtractedEvent::new(title, start, "https://venue.example/events")
}

#[tokio::test]
async fn create_and_get_source() {
    let (repo, _container) = setup_test_db().await;

    let created = repo
        .create_source(
            &NewSource::new("https://venue.example/events", "venue.example").with_name("Venue"),
        )
        .await
        .unwrap();

    assert_eq!(created.status, SourceStatus::Pending);
    assert_eq!(created.name, "Venue");
    assert_eq!(created.domain, "venue.example");
    assert!(created.recipe.is_none());
    assert_eq!(created.reanalysis_attempts, 0);

    let by_id = repo.get_source(created.id).await.unwrap().unwrap();
    assert_eq!(by_id, created);

    let by_url = repo
        .get_source_by_url("https://venue.example/events")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_url.id, created.id);

    assert!(repo.get_source(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_url_is_rejected() {
    let (repo, _container) = setup_test_db().await;
    let new = NewSource::new("https://venue.example/events", "venue.example");

    repo.create_source(&new).await.unwrap();
    let err = repo.create_source(&new).await.unwrap_err();

    assert!(matches!(&err, AppError::DatabaseError(msg) if msg.contains("already registered")));
}

#[tokio::test]
async fn save_recipe_round_trips_jsonb() {
    let (repo, _container) = setup_test_db().await;
    let source = repo
        .create_source(&NewSource::new("https://venue.example/events", "venue.example"))
        .await
        .unwrap();

    let recipe = css_recipe();
    repo.save_recipe(source.id, &recipe, SourceStatus::Active)
        .await
        .unwrap();

    let loaded = repo.get_source(source.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, SourceStatus::Active);
    assert_eq!(loaded.recipe, Some(recipe));

    let structured = Recipe::structured_data("Event", 0.95, "found 4 Event items").unwrap();
    repo.save_recipe(source.id, &structured, SourceStatus::Active)
        .await
        .unwrap();
    let loaded = repo.get_source(source.id).await.unwrap().unwrap();
    assert_eq!(loaded.recipe, Some(structured));
}

#[tokio::test]
async fn outcome_update_persists_lifecycle_columns() {
    let (repo, _container) = setup_test_db().await;
    let mut source = repo
        .create_source(&NewSource::new("https://venue.example/events", "venue.example"))
        .await
        .unwrap();
    repo.save_recipe(source.id, &css_recipe(), SourceStatus::Active)
        .await
        .unwrap();

    let now = Utc::now();
    source.status = SourceStatus::Disabled;
    source.resume_status = Some(SourceStatus::Stale);
    source.last_event_count = 0;
    source.last_scraped_at = Some(now);
    source.last_error = Some("replay produced no events".into());
    source.reanalysis_attempts = 2;
    source.next_analysis_at = Some(now + TimeDelta::hours(6));

    repo.update_source_outcome(source.id, &source.outcome_update())
        .await
        .unwrap();

    let loaded = repo.get_source(source.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, SourceStatus::Disabled);
    assert_eq!(loaded.resume_status, Some(SourceStatus::Stale));
    assert_eq!(loaded.reanalysis_attempts, 2);
    assert_eq!(loaded.last_error.as_deref(), Some("replay produced no events"));
    // Postgres keeps microseconds.
    let scraped = loaded.last_scraped_at.unwrap();
    assert!((scraped - now).num_milliseconds().abs() < 1);
    assert!(loaded.next_analysis_at.unwrap() > scraped);
}

#[tokio::test]
async fn update_missing_source_fails() {
    let (repo, _container) = setup_test_db().await;
    let mut ghost = repo
        .create_source(&NewSource::new("https://venue.example/events", "venue.example"))
        .await
        .unwrap();
    ghost.id = Uuid::new_v4();

    let err = repo
        .update_source_outcome(ghost.id, &ghost.outcome_update())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));

    let err = repo
        .save_recipe(ghost.id, &css_recipe(), SourceStatus::Active)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn enabled_sources_exclude_failed_and_disabled() {
    let (repo, _container) = setup_test_db().await;

    let mut ids = Vec::new();
    for (i, status) in [
        SourceStatus::Pending,
        SourceStatus::Failed,
        SourceStatus::Disabled,
        SourceStatus::Stale,
    ]
    .into_iter()
    .enumerate()
    {
        let mut source = repo
            .create_source(&NewSource::new(
                format!("https://venue{i}.example/events"),
                format!("venue{i}.example"),
            ))
            .await
            .unwrap();
        if status != SourceStatus::Pending {
            repo.save_recipe(source.id, &css_recipe(), SourceStatus::Active)
                .await
                .unwrap();
            source.status = status;
            source.resume_status = (status == SourceStatus::Disabled).then_some(SourceStatus::Active);
            repo.update_source_outcome(source.id, &source.outcome_update())
                .await
                .unwrap();
        }
        ids.push(source.id);
    }

    let enabled: Vec<Uuid> = repo
        .list_enabled_sources()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(enabled, vec![ids[0], ids[3]]);

    let all = repo.list_sources().await.unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all.iter().map(|s| s.id).collect::<Vec<_>>(), ids);
}

#[tokio::test]
async fn upsert_event_dedups_per_source() {
    let (repo, _container) = setup_test_db().await;
    let a = repo
        .create_source(&NewSource::new("https://a.example/events", "a.example"))
        .await
        .unwrap();
    let b = repo
        .create_source(&NewSource::new("https://b.example/events", "b.example"))
        .await
        .unwrap();

    let mut jazz = event("Jazz Night", "2026-05-01T20:00:00-05:00");
    assert!(repo.upsert_event(a.id, &jazz).await.unwrap());

    jazz.price_min = Some(15.0);
    jazz.description = Some("Now with a price".into());
    assert!(!repo.upsert_event(a.id, &jazz).await.unwrap());

    // Same record under another source is a different row.
    assert!(repo.upsert_event(b.id, &jazz).await.unwrap());

    let other = event("Jazz Night", "2026-05-08T20:00:00-05:00");
    assert!(repo.upsert_event(a.id, &other).await.unwrap());

    assert_eq!(repo.event_count(a.id).await.unwrap(), 2);
    assert_eq!(repo.event_count(b.id).await.unwrap(), 1);
}
