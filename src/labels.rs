use anyhow::Result;

use crate::config::MutationType;
use crate::dataset::LabelIndex;
use crate::errors::PipelineError;
use crate::novelty::NoveltyFlag;

pub const ABNORMAL_LABEL: &str = "abnormal";
/// Class names of wild-type indel alleles start with this.
pub const WILD_TYPE_PREFIX: &str = "wt_";

/// Turns class predictions and novelty flags into final labels.
///
/// Rules, in order: class id to stripped class name; abnormal novelty wins;
/// in point-mutation runs any `wt_` class is abnormal.
pub struct LabelResolver<'a> {
    index: &'a LabelIndex,
    mutation_type: &'a MutationType,
}

impl<'a> LabelResolver<'a> {
    pub fn new(index: &'a LabelIndex, mutation_type: &'a MutationType) -> Self {
        Self {
            index,
            mutation_type,
        }
    }

    pub fn resolve(&self, class: u8, flag: NoveltyFlag) -> Result<String> {
        let name = self.index.class_name(class as usize).ok_or_else(|| {
            PipelineError::ShapeMismatch(format!(
                "class id {} is outside the label index of {} classes",
                class,
                self.index.len()
            ))
        })?;
        if flag == NoveltyFlag::Abnormal {
            return Ok(ABNORMAL_LABEL.to_string());
        }
        if self.mutation_type.is_point_mutation() && name.starts_with(WILD_TYPE_PREFIX) {
            return Ok(ABNORMAL_LABEL.to_string());
        }
        Ok(name.to_string())
    }

    pub fn resolve_all(&self, classes: &[u8], flags: &[NoveltyFlag]) -> Result<Vec<String>> {
        if classes.len() != flags.len() {
            return Err(PipelineError::ShapeMismatch(format!(
                "{} class predictions but {} novelty flags",
                classes.len(),
                flags.len()
            ))
            .into());
        }
        classes
            .iter()
            .zip(flags)
            .map(|(&class, &flag)| self.resolve(class, flag))
            .collect()
    }
}
