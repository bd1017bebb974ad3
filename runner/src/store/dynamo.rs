use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::AttributeValue;
use geojson::Feature;
use osprey_common::args::TableArgs;
use osprey_common::types::RequestStatus;

use super::records::{
    EndpointStatisticsItem, ImageRequestItem, RegionRequestItem, TileRequestItem, now_ms,
};
use super::{StartOutcome, StateStore};

/// Upper bound on optimistic-update retries before giving up. Conflicts are
/// short-lived; hitting this indicates a stuck table, not contention.
const MAX_CONFLICT_RETRIES: usize = 16;

#[derive(Clone)]
pub struct DynamoStateStore {
    client: Client,
    image_table: String,
    region_table: String,
    outstanding_table: String,
    endpoint_table: String,
    feature_table: String,
}

impl DynamoStateStore {
    pub fn new(client: Client, tables: &TableArgs) -> Self {
        Self {
            client,
            image_table: tables.image_request_table.clone(),
            region_table: tables.region_request_table.clone(),
            outstanding_table: tables.outstanding_table.clone(),
            endpoint_table: tables.endpoint_table.clone(),
            feature_table: tables.feature_table.clone(),
        }
    }
}

fn s(value: impl Into<String>) -> AttributeValue {
    AttributeValue::S(value.into())
}

fn n(value: i64) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

fn nu(value: u64) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

fn get_s(map: &HashMap<String, AttributeValue>, key: &str) -> Result<String> {
    map.get(key)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .with_context(|| format!("missing string attribute {key}"))
}

fn get_i64(map: &HashMap<String, AttributeValue>, key: &str) -> Result<i64> {
    map.get(key)
        .and_then(|v| v.as_n().ok())
        .and_then(|v| v.parse().ok())
        .with_context(|| format!("missing numeric attribute {key}"))
}

fn get_u64_opt(map: &HashMap<String, AttributeValue>, key: &str) -> Option<u64> {
    map.get(key)
        .and_then(|v| v.as_n().ok())
        .and_then(|v| v.parse().ok())
}

fn get_i64_opt(map: &HashMap<String, AttributeValue>, key: &str) -> Option<i64> {
    map.get(key)
        .and_then(|v| v.as_n().ok())
        .and_then(|v| v.parse().ok())
}

fn get_string_list(map: &HashMap<String, AttributeValue>, key: &str) -> Vec<String> {
    map.get(key)
        .and_then(|v| v.as_l().ok())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_s().ok().cloned())
                .collect()
        })
        .unwrap_or_default()
}

fn is_conditional_check_failed<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> bool {
    matches!(
        err.as_service_error().and_then(|e| e.code()),
        Some("ConditionalCheckFailedException")
    )
}

fn image_item_attrs(item: &ImageRequestItem) -> Result<HashMap<String, AttributeValue>> {
    let mut map = HashMap::new();
    map.insert("image_id".into(), s(&item.image_id));
    map.insert("job_id".into(), s(&item.job_id));
    map.insert("image_url".into(), s(&item.image_url));
    map.insert("start_time".into(), n(item.start_time));
    if let Some(end_time) = item.end_time {
        map.insert("end_time".into(), n(end_time));
    }
    if let Some(count) = item.region_count {
        map.insert("region_count".into(), nu(count));
    }
    map.insert("region_success".into(), nu(item.region_success));
    map.insert("region_error".into(), nu(item.region_error));
    map.insert("capacity_acquired".into(), nu(item.capacity_acquired));
    map.insert(
        "request".into(),
        s(serde_json::to_string(&item.request).context("serialize image request echo")?),
    );
    Ok(map)
}

fn image_item_from_attrs(map: &HashMap<String, AttributeValue>) -> Result<ImageRequestItem> {
    Ok(ImageRequestItem {
        image_id: get_s(map, "image_id")?,
        job_id: get_s(map, "job_id")?,
        image_url: get_s(map, "image_url")?,
        start_time: get_i64(map, "start_time")?,
        end_time: get_i64_opt(map, "end_time"),
        region_count: get_u64_opt(map, "region_count"),
        region_success: get_u64_opt(map, "region_success").unwrap_or(0),
        region_error: get_u64_opt(map, "region_error").unwrap_or(0),
        capacity_acquired: get_u64_opt(map, "capacity_acquired").unwrap_or(0),
        request: serde_json::from_str(&get_s(map, "request")?)
            .context("decode image request echo")?,
    })
}

fn region_item_attrs(item: &RegionRequestItem) -> Result<HashMap<String, AttributeValue>> {
    let mut map = HashMap::new();
    map.insert("image_id".into(), s(&item.image_id));
    map.insert("region_id".into(), s(&item.region_id));
    map.insert("job_id".into(), s(&item.job_id));
    map.insert("model_name".into(), s(&item.model_name));
    map.insert("start_time".into(), n(item.start_time));
    if let Some(end_time) = item.end_time {
        map.insert("end_time".into(), n(end_time));
    }
    if let Some(total) = item.total_tiles {
        map.insert("total_tiles".into(), nu(total));
    }
    map.insert(
        "succeeded_tiles".into(),
        AttributeValue::L(item.succeeded_tiles.iter().map(s).collect()),
    );
    map.insert(
        "failed_tiles".into(),
        AttributeValue::L(item.failed_tiles.iter().map(s).collect()),
    );
    if let Some(duration) = item.processing_duration {
        map.insert("processing_duration".into(), n(duration));
    }
    map.insert(
        "request".into(),
        s(serde_json::to_string(&item.request).context("serialize region request echo")?),
    );
    Ok(map)
}

fn region_item_from_attrs(map: &HashMap<String, AttributeValue>) -> Result<RegionRequestItem> {
    Ok(RegionRequestItem {
        image_id: get_s(map, "image_id")?,
        region_id: get_s(map, "region_id")?,
        job_id: get_s(map, "job_id")?,
        model_name: get_s(map, "model_name")?,
        start_time: get_i64(map, "start_time")?,
        end_time: get_i64_opt(map, "end_time"),
        total_tiles: get_u64_opt(map, "total_tiles"),
        succeeded_tiles: get_string_list(map, "succeeded_tiles"),
        failed_tiles: get_string_list(map, "failed_tiles"),
        processing_duration: get_i64_opt(map, "processing_duration"),
        request: serde_json::from_str(&get_s(map, "request")?)
            .context("decode region request echo")?,
    })
}

#[async_trait]
impl StateStore for DynamoStateStore {
    async fn start_image(&self, item: ImageRequestItem) -> Result<StartOutcome> {
        let result = self
            .client
            .put_item()
            .table_name(&self.image_table)
            .set_item(Some(image_item_attrs(&item)?))
            .condition_expression("attribute_not_exists(image_id)")
            .send()
            .await;
        match result {
            Ok(_) => Ok(StartOutcome::Started),
            Err(err) if is_conditional_check_failed(&err) => Ok(StartOutcome::AlreadyStarted),
            Err(err) => Err(err).context("start image record"),
        }
    }

    async fn get_image(&self, image_id: &str) -> Result<Option<ImageRequestItem>> {
        let response = self
            .client
            .get_item()
            .table_name(&self.image_table)
            .key("image_id", s(image_id))
            .consistent_read(true)
            .send()
            .await
            .context("get image record")?;
        response.item().map(image_item_from_attrs).transpose()
    }

    async fn set_region_count(&self, image_id: &str, count: u64, acquired: u64) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.image_table)
            .key("image_id", s(image_id))
            .update_expression("SET region_count = :count, capacity_acquired = :acquired")
            .expression_attribute_values(":count", nu(count))
            .expression_attribute_values(":acquired", nu(acquired))
            .condition_expression("attribute_exists(image_id)")
            .send()
            .await
            .context("record region count")?;
        Ok(())
    }

    async fn complete_region(&self, image_id: &str, failed: bool) -> Result<ImageRequestItem> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let item = self
                .get_image(image_id)
                .await?
                .with_context(|| format!("image {image_id} has no record"))?;
            let count = item
                .region_count
                .with_context(|| format!("image {image_id} has no region count"))?;
            if item.region_success + item.region_error >= count {
                // A redelivered region already counted; nothing to add.
                return Ok(item);
            }
            let (attr, old, new) = if failed {
                ("region_error", item.region_error, item.region_error + 1)
            } else {
                ("region_success", item.region_success, item.region_success + 1)
            };
            let result = self
                .client
                .update_item()
                .table_name(&self.image_table)
                .key("image_id", s(image_id))
                .update_expression(format!("SET {attr} = :new"))
                .expression_attribute_values(":new", nu(new))
                .expression_attribute_values(":old", nu(old))
                .condition_expression(format!("{attr} = :old"))
                .return_values(aws_sdk_dynamodb::types::ReturnValue::AllNew)
                .send()
                .await;
            match result {
                Ok(response) => {
                    let attrs = response
                        .attributes()
                        .context("update returned no attributes")?;
                    return image_item_from_attrs(attrs);
                }
                Err(err) if is_conditional_check_failed(&err) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(err) => return Err(err).context("complete region counter"),
            }
        }
        bail!("complete_region for {image_id} kept conflicting");
    }

    async fn end_image(&self, image_id: &str, end_time: i64) -> Result<()> {
        let result = self
            .client
            .update_item()
            .table_name(&self.image_table)
            .key("image_id", s(image_id))
            .update_expression("SET end_time = :t")
            .expression_attribute_values(":t", n(end_time))
            .condition_expression("attribute_not_exists(end_time) OR end_time < :t")
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            // Already closed at a later time; the close is monotonic.
            Err(err) if is_conditional_check_failed(&err) => Ok(()),
            Err(err) => Err(err).context("end image record"),
        }
    }

    async fn put_region(&self, item: RegionRequestItem) -> Result<()> {
        let result = self
            .client
            .put_item()
            .table_name(&self.region_table)
            .set_item(Some(region_item_attrs(&item)?))
            .condition_expression("attribute_not_exists(image_id)")
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_conditional_check_failed(&err) => {
                // Requeued region being picked up again: refresh its lease.
                self.client
                    .update_item()
                    .table_name(&self.region_table)
                    .key("image_id", s(&item.image_id))
                    .key("region_id", s(&item.region_id))
                    .update_expression("SET start_time = :t")
                    .expression_attribute_values(":t", n(now_ms()))
                    .send()
                    .await
                    .context("refresh region lease")?;
                Ok(())
            }
            Err(err) => Err(err).context("create region record"),
        }
    }

    async fn get_region(
        &self,
        image_id: &str,
        region_id: &str,
    ) -> Result<Option<RegionRequestItem>> {
        let response = self
            .client
            .get_item()
            .table_name(&self.region_table)
            .key("image_id", s(image_id))
            .key("region_id", s(region_id))
            .consistent_read(true)
            .send()
            .await
            .context("get region record")?;
        response.item().map(region_item_from_attrs).transpose()
    }

    async fn regions_by_image(&self, image_id: &str) -> Result<Vec<RegionRequestItem>> {
        let mut items = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let response = self
                .client
                .query()
                .table_name(&self.region_table)
                .key_condition_expression("image_id = :image_id")
                .expression_attribute_values(":image_id", s(image_id))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .context("query regions by image")?;
            for attrs in response.items() {
                items.push(region_item_from_attrs(attrs)?);
            }
            match response.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn set_total_tiles(&self, image_id: &str, region_id: &str, total: u64) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.region_table)
            .key("image_id", s(image_id))
            .key("region_id", s(region_id))
            .update_expression("SET total_tiles = :total")
            .expression_attribute_values(":total", nu(total))
            .condition_expression("attribute_exists(image_id)")
            .send()
            .await
            .context("record total tiles")?;
        Ok(())
    }

    async fn record_tile_outcome(
        &self,
        image_id: &str,
        region_id: &str,
        tile_id: &str,
        failed: bool,
    ) -> Result<RegionRequestItem> {
        let attr = if failed {
            "failed_tiles"
        } else {
            "succeeded_tiles"
        };
        let result = self
            .client
            .update_item()
            .table_name(&self.region_table)
            .key("image_id", s(image_id))
            .key("region_id", s(region_id))
            .update_expression(format!(
                "SET {attr} = list_append(if_not_exists({attr}, :empty), :tile)"
            ))
            .expression_attribute_values(":empty", AttributeValue::L(Vec::new()))
            .expression_attribute_values(":tile", AttributeValue::L(vec![s(tile_id)]))
            .expression_attribute_values(":tid", s(tile_id))
            .condition_expression(
                "NOT contains(succeeded_tiles, :tid) AND NOT contains(failed_tiles, :tid)",
            )
            .return_values(aws_sdk_dynamodb::types::ReturnValue::AllNew)
            .send()
            .await;
        match result {
            Ok(response) => {
                let attrs = response
                    .attributes()
                    .context("update returned no attributes")?;
                region_item_from_attrs(attrs)
            }
            Err(err) if is_conditional_check_failed(&err) => {
                // Tile already recorded by an earlier delivery.
                self.get_region(image_id, region_id)
                    .await?
                    .with_context(|| format!("region {image_id}/{region_id} has no record"))
            }
            Err(err) => Err(err).context("record tile outcome"),
        }
    }

    async fn finish_region(
        &self,
        image_id: &str,
        region_id: &str,
        duration_ms: i64,
    ) -> Result<bool> {
        let result = self
            .client
            .update_item()
            .table_name(&self.region_table)
            .key("image_id", s(image_id))
            .key("region_id", s(region_id))
            .update_expression("SET end_time = :t, processing_duration = :d")
            .expression_attribute_values(":t", n(now_ms()))
            .expression_attribute_values(":d", n(duration_ms))
            .condition_expression("attribute_not_exists(end_time)")
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) if is_conditional_check_failed(&err) => Ok(false),
            Err(err) => Err(err).context("finish region record"),
        }
    }

    async fn list_stale_regions(&self, cutoff_ms: i64) -> Result<Vec<RegionRequestItem>> {
        let mut items = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let response = self
                .client
                .scan()
                .table_name(&self.region_table)
                .filter_expression("attribute_not_exists(end_time) AND start_time < :cutoff")
                .expression_attribute_values(":cutoff", n(cutoff_ms))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .context("scan stale regions")?;
            for attrs in response.items() {
                items.push(region_item_from_attrs(attrs)?);
            }
            match response.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn put_outstanding_tile(&self, item: TileRequestItem) -> Result<()> {
        self.client
            .put_item()
            .table_name(&self.outstanding_table)
            .item("inference_id", s(&item.inference_id))
            .item(
                "record",
                s(serde_json::to_string(&item).context("serialize tile record")?),
            )
            .item("expire_time", n(item.expire_time))
            .send()
            .await
            .context("put outstanding tile")?;
        Ok(())
    }

    async fn get_outstanding_tile(&self, inference_id: &str) -> Result<Option<TileRequestItem>> {
        let response = self
            .client
            .get_item()
            .table_name(&self.outstanding_table)
            .key("inference_id", s(inference_id))
            .consistent_read(true)
            .send()
            .await
            .context("get outstanding tile")?;
        let Some(attrs) = response.item() else {
            return Ok(None);
        };
        let record = get_s(attrs, "record")?;
        Ok(Some(
            serde_json::from_str(&record).context("decode tile record")?,
        ))
    }

    async fn update_tile_status(
        &self,
        inference_id: &str,
        status: RequestStatus,
        output_location: Option<String>,
    ) -> Result<()> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let Some(mut item) = self.get_outstanding_tile(inference_id).await? else {
                bail!("outstanding tile {inference_id} has no record");
            };
            let old = serde_json::to_string(&item).context("serialize tile record")?;
            item.tile_status = status;
            if output_location.is_some() {
                item.output_location = output_location.clone();
            }
            let result = self
                .client
                .update_item()
                .table_name(&self.outstanding_table)
                .key("inference_id", s(inference_id))
                .update_expression("SET #r = :new")
                .expression_attribute_names("#r", "record")
                .expression_attribute_values(
                    ":new",
                    s(serde_json::to_string(&item).context("serialize tile record")?),
                )
                .expression_attribute_values(":old", s(old))
                .condition_expression("#r = :old")
                .send()
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(err) if is_conditional_check_failed(&err) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(err) => return Err(err).context("update tile status"),
            }
        }
        bail!("update_tile_status for {inference_id} kept conflicting");
    }

    async fn upsert_endpoint(&self, endpoint_name: &str, max_in_progress: u64) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.endpoint_table)
            .key("endpoint_name", s(endpoint_name))
            .update_expression(
                "SET max_in_progress = :max, in_progress = if_not_exists(in_progress, :zero)",
            )
            .expression_attribute_values(":max", nu(max_in_progress))
            .expression_attribute_values(":zero", nu(0))
            .send()
            .await
            .context("upsert endpoint statistics")?;
        Ok(())
    }

    async fn get_endpoint(&self, endpoint_name: &str) -> Result<Option<EndpointStatisticsItem>> {
        let response = self
            .client
            .get_item()
            .table_name(&self.endpoint_table)
            .key("endpoint_name", s(endpoint_name))
            .consistent_read(true)
            .send()
            .await
            .context("get endpoint statistics")?;
        let Some(attrs) = response.item() else {
            return Ok(None);
        };
        Ok(Some(EndpointStatisticsItem {
            endpoint_name: get_s(attrs, "endpoint_name")?,
            max_in_progress: get_u64_opt(attrs, "max_in_progress").unwrap_or(0),
            in_progress: get_u64_opt(attrs, "in_progress").unwrap_or(0),
        }))
    }

    async fn try_acquire_endpoint(&self, endpoint_name: &str, count: u64) -> Result<bool> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let Some(stats) = self.get_endpoint(endpoint_name).await? else {
                tracing::warn!(endpoint = endpoint_name, "no statistics for endpoint");
                return Ok(false);
            };
            if stats.in_progress + count > stats.max_in_progress {
                return Ok(false);
            }
            let result = self
                .client
                .update_item()
                .table_name(&self.endpoint_table)
                .key("endpoint_name", s(endpoint_name))
                .update_expression("SET in_progress = :new")
                .expression_attribute_values(":new", nu(stats.in_progress + count))
                .expression_attribute_values(":old", nu(stats.in_progress))
                .condition_expression("in_progress = :old")
                .send()
                .await;
            match result {
                Ok(_) => return Ok(true),
                Err(err) if is_conditional_check_failed(&err) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(err) => return Err(err).context("acquire endpoint capacity"),
            }
        }
        Ok(false)
    }

    async fn release_endpoint(&self, endpoint_name: &str, count: u64) -> Result<()> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let Some(stats) = self.get_endpoint(endpoint_name).await? else {
                return Ok(());
            };
            let new = stats.in_progress.saturating_sub(count);
            let result = self
                .client
                .update_item()
                .table_name(&self.endpoint_table)
                .key("endpoint_name", s(endpoint_name))
                .update_expression("SET in_progress = :new")
                .expression_attribute_values(":new", nu(new))
                .expression_attribute_values(":old", nu(stats.in_progress))
                .condition_expression("in_progress = :old")
                .send()
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(err) if is_conditional_check_failed(&err) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(err) => return Err(err).context("release endpoint capacity"),
            }
        }
        bail!("release_endpoint for {endpoint_name} kept conflicting");
    }

    async fn add_features(
        &self,
        image_id: &str,
        rows: BTreeMap<String, Vec<Feature>>,
        expire_time: i64,
    ) -> Result<()> {
        for (range_key, features) in rows {
            let encoded: Vec<AttributeValue> = features
                .iter()
                .map(|f| serde_json::to_string(f).map(s))
                .collect::<Result<_, _>>()
                .context("serialize features")?;
            self.client
                .update_item()
                .table_name(&self.feature_table)
                .key("hash_key", s(image_id))
                .key("range_key", s(&range_key))
                .update_expression(
                    "SET features = list_append(if_not_exists(features, :empty), :f), \
                     expire_time = :expire_time",
                )
                .expression_attribute_values(":empty", AttributeValue::L(Vec::new()))
                .expression_attribute_values(":f", AttributeValue::L(encoded))
                .expression_attribute_values(":expire_time", n(expire_time))
                .send()
                .await
                .with_context(|| format!("append features to row {range_key}"))?;
        }
        Ok(())
    }

    async fn features_by_image(&self, image_id: &str) -> Result<Vec<Vec<Feature>>> {
        let mut rows = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let response = self
                .client
                .query()
                .table_name(&self.feature_table)
                .key_condition_expression("hash_key = :h")
                .expression_attribute_values(":h", s(image_id))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .context("query feature rows")?;
            for attrs in response.items() {
                let features = attrs
                    .get("features")
                    .and_then(|v| v.as_l().ok())
                    .map(|list| {
                        list.iter()
                            .filter_map(|v| v.as_s().ok())
                            .map(|encoded| {
                                serde_json::from_str::<Feature>(encoded)
                                    .context("decode stored feature")
                            })
                            .collect::<Result<Vec<_>>>()
                    })
                    .transpose()?
                    .unwrap_or_default();
                rows.push(features);
            }
            match response.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(rows)
    }
}
