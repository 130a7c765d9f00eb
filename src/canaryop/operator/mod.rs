/*
 * Copyright (C) 2025 The Canaryop Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The canary rollout protocol. State lives entirely in annotations on the
//! watched resources; the two reconcilers in this module converge on it
//! independently.

use std::error::Error;

use crate::canaryop::k8s::DeploymentConfig;
use crate::canaryop::util::new_error;

pub mod deployment;
pub mod pod;

/// Name of the container inside the workload template to swap.
pub const ANNOTATION_CANARY_NAME: &str = "canary-name";
/// Candidate image for the canary container.
pub const ANNOTATION_CANARY_IMAGE: &str = "canary-image";
/// Ripening window, parsed as a duration string.
pub const ANNOTATION_CANARY_DURATION: &str = "canary-duration";
/// Name of the live canary pod once spawned.
pub const ANNOTATION_CANARY_POD: &str = "canary-pod";
/// Image that failed its canary; suppresses further attempts until cleared.
pub const ANNOTATION_CANARY_FAIL: &str = "canary-fail";

pub const LABEL_CANARY: &str = "canary";
pub const LABEL_CANARY_FOR: &str = "canary-for";
pub const LABEL_DEPLOYMENTCONFIG: &str = "deploymentconfig";
pub const LABEL_APP: &str = "app";

/// Selector matching everything both controllers watch.
pub const CANARY_SELECTOR: &str = "canary=true";

pub const DEFAULT_CANARY_DURATION: &str = "15m";

/// Extracts the canary target from the workload's annotations. Both the
/// container name and the candidate image must be present.
pub fn get_name_and_image(
    dc: &DeploymentConfig,
) -> Result<(String, String), Box<dyn Error + Send + Sync>> {
    let name = dc.metadata.annotations.get(ANNOTATION_CANARY_NAME);
    let image = dc.metadata.annotations.get(ANNOTATION_CANARY_IMAGE);
    match (name, image) {
        (Some(name), Some(image)) => Ok((name.clone(), image.clone())),
        (None, Some(_)) => Err(new_error(format!(
            "workload {} does not have a container name defined",
            dc.name()
        ))),
        (Some(_), None) => Err(new_error(format!(
            "workload {} does not have an image defined",
            dc.name()
        ))),
        (None, None) => Err(new_error(format!(
            "workload {} does not have a container name or image defined",
            dc.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canaryop::k8s::{DeploymentConfigSpec, ObjectMeta};

    fn workload_with_annotations(pairs: &[(&str, &str)]) -> DeploymentConfig {
        let mut meta = ObjectMeta {
            name: Some("testing".to_string()),
            ..Default::default()
        };
        for (key, value) in pairs {
            meta.annotations
                .insert((*key).to_string(), (*value).to_string());
        }
        DeploymentConfig::new(meta, DeploymentConfigSpec::default())
    }

    #[test]
    fn name_and_image_requires_both_annotations() {
        assert!(get_name_and_image(&workload_with_annotations(&[])).is_err());
        assert!(get_name_and_image(&workload_with_annotations(&[(
            ANNOTATION_CANARY_NAME,
            "testing"
        )]))
        .is_err());
        assert!(get_name_and_image(&workload_with_annotations(&[(
            ANNOTATION_CANARY_IMAGE,
            "testing"
        )]))
        .is_err());

        let (name, image) = get_name_and_image(&workload_with_annotations(&[
            (ANNOTATION_CANARY_NAME, "testing"),
            (ANNOTATION_CANARY_IMAGE, "testing"),
        ]))
        .expect("both annotations present");
        assert_eq!(name, "testing");
        assert_eq!(image, "testing");
    }
}
