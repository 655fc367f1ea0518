//! 阶段层：阶段词表、分类器、阶段目录与路由

pub mod catalog;
pub mod classifier;
pub mod label;
pub mod router;

pub use catalog::{ClassifierEntry, StageCatalog, StageEntry};
pub use classifier::{
    build_instruction, StageClassifier, StageParser, DEFAULT_CLASSIFIER_TEMPLATE, STAGES_PLACEHOLDER,
};
pub use label::{Classification, StageLabel};
pub use router::{RoutedTurn, StageRouter, StageTable};
