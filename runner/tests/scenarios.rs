//! End-to-end scenarios: the real scheduler, region processor, tile pool,
//! aggregation, and sink selection running against in-memory backends.

mod common;

use std::time::Duration;

use common::*;
use osprey_common::types::RequestStatus;
use osprey_runner::features::bounds_of;
use osprey_runner::imagery::ObjectStore;
use osprey_runner::queue::RequestQueue;
use osprey_runner::status::StatusScope;
use osprey_runner::worker;

const IMAGE_ID: &str = "j1:s3://bucket/img.tif";

#[tokio::test]
async fn happy_path_synchronous_endpoint() {
    let detector = ScriptedDetector::new(DetectorScript::Features(vec![
        [10.0, 10.0, 20.0, 20.0],
        [10.0, 10.0, 20.0, 20.0],
    ]));
    let harness = harness(
        test_config(),
        SyntheticRasterSource::new(1900, 1000),
        detector,
    );

    harness
        .image_queue
        .send(&image_request_body("j1", "SM_ENDPOINT"))
        .await
        .unwrap();
    harness.drain_image_queue().await.unwrap();
    assert_eq!(harness.region_queue.len(), 1);
    harness.drain_region_queue().await.unwrap();

    // Two tiles, two detections each, deduplicated to one per tile bucket.
    let writes = harness.sink.writes();
    assert_eq!(writes.len(), 1);
    let (image_id, features) = &writes[0];
    assert_eq!(image_id, IMAGE_ID);
    assert_eq!(features.len(), 2);

    let mut bounds: Vec<[f64; 4]> = features.iter().map(|f| bounds_of(f).unwrap()).collect();
    bounds.sort_by(|a, b| a[0].partial_cmp(&b[0]).unwrap());
    assert_eq!(bounds[0], [10.0, 10.0, 20.0, 20.0]);
    assert_eq!(bounds[1], [984.0, 10.0, 994.0, 20.0]);
    for feature in features {
        assert_eq!(
            feature.property("image_id").unwrap().as_str().unwrap(),
            IMAGE_ID
        );
    }

    // Terminal image bookkeeping.
    let image = harness.store.image(IMAGE_ID).unwrap();
    assert!(image.end_time.is_some());
    assert_eq!(image.region_count, Some(1));
    assert_eq!(image.region_success + image.region_error, 1);

    let statuses = harness.publisher.statuses(StatusScope::Image);
    assert_eq!(statuses.last(), Some(&RequestStatus::Success));

    // Every tile landed in exactly one terminal list.
    let regions = harness.store.regions_of(IMAGE_ID);
    let region = &regions[0];
    assert_eq!(region.total_tiles, Some(2));
    assert_eq!(region.succeeded_tiles.len(), 2);
    assert!(region.failed_tiles.is_empty());
}

#[tokio::test(start_paused = true)]
async fn partial_failure_marks_image_partial() {
    let detector = ScriptedDetector::new(DetectorScript::FailColumn {
        features: vec![[10.0, 10.0, 20.0, 20.0]],
        column: 974,
    });
    let harness = harness(
        test_config(),
        SyntheticRasterSource::new(2000, 1000),
        detector.clone(),
    );

    harness
        .image_queue
        .send(&image_request_body("j1", "SM_ENDPOINT"))
        .await
        .unwrap();
    harness.drain_image_queue().await.unwrap();
    harness.drain_region_queue().await.unwrap();

    let regions = harness.store.regions_of(IMAGE_ID);
    let region = &regions[0];
    assert_eq!(region.total_tiles, Some(3));
    assert_eq!(region.succeeded_tiles.len(), 2);
    assert_eq!(region.failed_tiles.len(), 1);

    let image = harness.store.image(IMAGE_ID).unwrap();
    assert!(image.end_time.is_some());
    assert_eq!(image.region_error, 1);

    // The surviving tiles still sink their detections.
    let writes = harness.sink.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1.len(), 2);

    let statuses = harness.publisher.statuses(StatusScope::Image);
    assert_eq!(statuses.last(), Some(&RequestStatus::Partial));

    // Middle tile was retried once before failing.
    assert_eq!(
        detector
            .invocations
            .load(std::sync::atomic::Ordering::SeqCst),
        4
    );
}

#[tokio::test]
async fn capacity_throttling_admits_one_image_at_a_time() {
    let mut config = test_config();
    config.default_instance_concurrency = 1;
    config.tile_workers_per_instance = 1;
    let detector =
        ScriptedDetector::new(DetectorScript::Features(vec![[10.0, 10.0, 20.0, 20.0]]));
    let harness = harness(config, SyntheticRasterSource::new(500, 500), detector.clone());

    harness
        .image_queue
        .send(&image_request_body("j1", "SM_ENDPOINT"))
        .await
        .unwrap();
    harness
        .image_queue
        .send(&image_request_body("j2", "SM_ENDPOINT"))
        .await
        .unwrap();
    harness.drain_image_queue().await.unwrap();

    // One image proceeded, the other went back to the queue unstarted.
    assert_eq!(harness.region_queue.len(), 1);
    assert!(harness.store.image("j2:s3://bucket/img.tif").is_none());
    assert_eq!(harness.image_queue.len(), 1);
    assert_eq!(harness.image_queue.invisible_len(), 1);

    harness.drain_region_queue().await.unwrap();
    assert_eq!(harness.store.endpoint("detector").unwrap().in_progress, 0);

    // The throttled request reappears and now gets through.
    harness.image_queue.make_all_visible();
    harness.drain_image_queue().await.unwrap();
    harness.drain_region_queue().await.unwrap();

    assert!(
        harness
            .store
            .image("j2:s3://bucket/img.tif")
            .unwrap()
            .end_time
            .is_some()
    );
    assert_eq!(harness.sink.writes().len(), 2);
    assert_eq!(harness.store.in_progress_high_water("detector"), 1);
    assert!(
        detector
            .max_concurrent
            .load(std::sync::atomic::Ordering::SeqCst)
            <= 1
    );
}

#[tokio::test]
async fn duplicate_delivery_processes_once() {
    let detector =
        ScriptedDetector::new(DetectorScript::Features(vec![[10.0, 10.0, 20.0, 20.0]]));
    let harness = harness(
        test_config(),
        SyntheticRasterSource::new(500, 500),
        detector,
    );

    let body = image_request_body("j1", "SM_ENDPOINT");
    harness.image_queue.send(&body).await.unwrap();
    harness.image_queue.send(&body).await.unwrap();
    harness.drain_image_queue().await.unwrap();

    // The loser finished its message without dispatching regions.
    assert_eq!(harness.region_queue.len(), 1);
    assert_eq!(harness.image_queue.len(), 0);

    harness.drain_region_queue().await.unwrap();
    assert_eq!(harness.sink.writes().len(), 1);
    assert_eq!(harness.store.endpoint("detector").unwrap().in_progress, 0);
}

#[tokio::test]
async fn invalid_model_output_fails_image_without_sinking() {
    let detector = ScriptedDetector::new(DetectorScript::InvalidSchema);
    let harness = harness(
        test_config(),
        SyntheticRasterSource::new(2000, 1000),
        detector,
    );

    harness
        .image_queue
        .send(&image_request_body("j1", "SM_ENDPOINT"))
        .await
        .unwrap();
    harness.drain_image_queue().await.unwrap();
    harness.drain_region_queue().await.unwrap();

    let regions = harness.store.regions_of(IMAGE_ID);
    assert_eq!(regions[0].failed_tiles.len(), 3);
    assert!(regions[0].succeeded_tiles.is_empty());

    let image = harness.store.image(IMAGE_ID).unwrap();
    assert!(image.end_time.is_some());

    assert!(harness.sink.writes().is_empty());
    let statuses = harness.publisher.statuses(StatusScope::Image);
    assert_eq!(statuses.last(), Some(&RequestStatus::Failed));
}

#[tokio::test]
async fn async_completion_resumes_region_and_image() {
    let detector = ScriptedDetector::new(DetectorScript::Queue);
    let harness = harness(
        test_config(),
        SyntheticRasterSource::new(1900, 1000),
        detector,
    );

    harness
        .image_queue
        .send(&image_request_body("j1", "HTTP_ENDPOINT"))
        .await
        .unwrap();
    harness.drain_image_queue().await.unwrap();
    harness.drain_region_queue().await.unwrap();

    // Both tiles are awaiting completion; nothing is terminal yet.
    let outstanding = harness.store.outstanding_tiles();
    assert_eq!(outstanding.len(), 2);
    assert!(
        outstanding
            .iter()
            .all(|tile| tile.tile_status == RequestStatus::InProgress)
    );
    assert!(harness.store.image(IMAGE_ID).unwrap().end_time.is_none());
    assert!(harness.sink.writes().is_empty());

    // Completion events arrive with the detections in the output objects.
    for tile in &outstanding {
        let output_location = tile.output_location.clone().unwrap();
        harness
            .object_store
            .put(
                &output_location,
                serde_json::json!({
                    "type": "FeatureCollection",
                    "features": [{
                        "type": "Feature",
                        "geometry": null,
                        "properties": {"bounds_imcoords": [10, 10, 20, 20]}
                    }]
                })
                .to_string()
                .into_bytes()
                .into(),
            )
            .await
            .unwrap();
        let key = output_location.strip_prefix("s3://artifacts/").unwrap();
        harness
            .tile_results_queue
            .send(
                &serde_json::json!({
                    "Records": [{
                        "eventSource": "aws:s3",
                        "s3": {
                            "bucket": {"name": "artifacts"},
                            "object": {"key": key}
                        }
                    }]
                })
                .to_string(),
            )
            .await
            .unwrap();
    }
    harness.drain_results_queue().await.unwrap();

    let image = harness.store.image(IMAGE_ID).unwrap();
    assert!(image.end_time.is_some());
    let writes = harness.sink.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1.len(), 2);
    let statuses = harness.publisher.statuses(StatusScope::Image);
    assert_eq!(statuses.last(), Some(&RequestStatus::Success));

    // A duplicate completion event changes nothing.
    let tile = &harness.store.outstanding_tiles()[0];
    let output_location = tile.output_location.clone().unwrap();
    let key = output_location.strip_prefix("s3://artifacts/").unwrap();
    harness
        .tile_results_queue
        .send(
            &serde_json::json!({
                "Records": [{
                    "s3": {"bucket": {"name": "artifacts"}, "object": {"key": key}}
                }]
            })
            .to_string(),
        )
        .await
        .unwrap();
    harness.drain_results_queue().await.unwrap();
    assert_eq!(harness.sink.writes().len(), 1);
    let regions = harness.store.regions_of(IMAGE_ID);
    assert_eq!(regions[0].succeeded_tiles.len(), 2);
}

#[tokio::test]
async fn reaper_releases_capacity_and_requeues_stale_region() {
    let detector =
        ScriptedDetector::new(DetectorScript::Features(vec![[10.0, 10.0, 20.0, 20.0]]));
    let harness = harness(
        test_config(),
        SyntheticRasterSource::new(500, 500),
        detector,
    );

    harness
        .image_queue
        .send(&image_request_body("j1", "SM_ENDPOINT"))
        .await
        .unwrap();
    harness.drain_image_queue().await.unwrap();

    // A worker starts the region and dies before any tile finishes.
    let messages = harness
        .region_queue
        .receive(Duration::ZERO, Duration::from_secs(1800), 1)
        .await
        .unwrap();
    let request = osprey_runner::api::RegionRequest::from_message(&messages[0].body).unwrap();
    harness
        .runtime
        .store
        .put_region(osprey_runner::store::RegionRequestItem::new(request.clone()))
        .await
        .unwrap();
    harness
        .runtime
        .store
        .set_total_tiles(&request.image_id, &request.region_id, 1)
        .await
        .unwrap();
    harness
        .store
        .age_region(&request.image_id, &request.region_id, Duration::from_secs(7200));
    assert_eq!(harness.store.endpoint("detector").unwrap().in_progress, 1);

    worker::sweep(&harness.runtime).await.unwrap();

    assert_eq!(harness.store.endpoint("detector").unwrap().in_progress, 0);
    // The requeued copy is processable right away.
    harness.drain_region_queue().await.unwrap();
    assert!(harness.store.image(IMAGE_ID).unwrap().end_time.is_some());
    assert_eq!(harness.sink.writes().len(), 1);
}

#[tokio::test]
async fn roi_excluding_everything_completes_trivially() {
    let detector =
        ScriptedDetector::new(DetectorScript::Features(vec![[10.0, 10.0, 20.0, 20.0]]));
    let harness = harness(
        test_config(),
        SyntheticRasterSource::new(500, 500),
        detector.clone(),
    );

    let body = serde_json::json!({
        "jobArn": "arn:aws:osprey:us-west-2:123456789012:job/j1",
        "jobId": "j1",
        "imageUrls": ["s3://bucket/img.tif"],
        "imageProcessor": {"name": "detector", "type": "SM_ENDPOINT"},
        "regionOfInterest": "POLYGON ((9000 9000, 9100 9000, 9100 9100, 9000 9100, 9000 9000))",
        "outputs": [{"type": "S3", "bucket": "out", "prefix": "results"}]
    })
    .to_string();
    harness.image_queue.send(&body).await.unwrap();
    harness.drain_image_queue().await.unwrap();

    assert_eq!(harness.region_queue.len(), 0);
    let image = harness.store.image(IMAGE_ID).unwrap();
    assert_eq!(image.region_count, Some(0));
    assert!(image.end_time.is_some());

    // An empty result document is still delivered.
    let writes = harness.sink.writes();
    assert_eq!(writes.len(), 1);
    assert!(writes[0].1.is_empty());
    assert_eq!(
        detector
            .invocations
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn raster_open_failure_fails_image() {
    let detector =
        ScriptedDetector::new(DetectorScript::Features(vec![[10.0, 10.0, 20.0, 20.0]]));
    let mut raster = SyntheticRasterSource::new(500, 500);
    raster.fail_open = true;
    let harness = harness(test_config(), raster, detector);

    harness
        .image_queue
        .send(&image_request_body("j1", "SM_ENDPOINT"))
        .await
        .unwrap();
    harness.drain_image_queue().await.unwrap();

    assert_eq!(harness.region_queue.len(), 0);
    assert_eq!(harness.image_queue.len(), 0);
    let image = harness.store.image(IMAGE_ID).unwrap();
    assert!(image.end_time.is_some());
    let statuses = harness.publisher.statuses(StatusScope::Image);
    assert_eq!(statuses.last(), Some(&RequestStatus::Failed));
    assert!(harness.sink.writes().is_empty());
}
