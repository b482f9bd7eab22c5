//! Concurrent region replication.

use crate::adapters::ComputeProvider;
use crate::error::{BuildError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Copy an image to every target region and wait for each copy to become
/// available.
///
/// Targets are deduplicated and the source region is dropped. Copies run
/// concurrently and independently; a failing region never cancels its
/// siblings. Returns the region-to-image map of successful copies and the
/// collected failures.
pub(crate) async fn replicate_image(
    compute: Arc<dyn ComputeProvider>,
    image_id: &str,
    name: &str,
    description: &str,
    source_region: &str,
    targets: &[String],
    availability_timeout: Duration,
) -> (HashMap<String, String>, Vec<(String, BuildError)>) {
    let mut seen = HashSet::new();
    let regions: Vec<String> = targets
        .iter()
        .filter(|region| region.as_str() != source_region && seen.insert(region.as_str()))
        .cloned()
        .collect();

    let mut tasks = JoinSet::new();
    for region in regions {
        let compute = Arc::clone(&compute);
        let image_id = image_id.to_string();
        let name = name.to_string();
        let description = description.to_string();
        let source = source_region.to_string();

        tasks.spawn(async move {
            let outcome: Result<String> = async {
                let copied =
                    compute.copy_image(&image_id, &name, &description, &source, &region).await?;
                compute.wait_image_available(&copied, &region, availability_timeout).await?;
                Ok(copied)
            }
            .await;
            (region, outcome)
        });
    }

    let mut copied = HashMap::new();
    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((region, Ok(image))) => {
                info!(region = %region, image = %image, "image copied");
                copied.insert(region, image);
            }
            Ok((region, Err(err))) => {
                warn!(region = %region, error = %err, "image copy failed");
                failures.push((region, err));
            }
            Err(join_err) => {
                failures.push((
                    "unknown".to_string(),
                    BuildError::internal(format!("region copy task failed: {join_err}")),
                ));
            }
        }
    }

    (copied, failures)
}
