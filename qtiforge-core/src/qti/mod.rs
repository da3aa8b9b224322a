//! QTI 3.0 output: item generation, visual assembly and the idempotent
//! patch operations applied to existing `question.xml` trees.

pub mod answer_key;
pub mod assembler;
pub mod encoding;
pub mod generator;

pub use answer_key::{update_correct_response, update_tree, AnswerKey, AnswerUpdateSummary};
pub use assembler::{AssembledItem, AssemblyFailure, AssemblyRequest, ItemAssembler};
pub use encoding::{detect_suspect_sequences, fix_encoding, fix_tree, scan_tree, EncodingFix, SuspectSequence};
pub use generator::{check_well_formed, ItemContent, QtiGenerator, QTI_NAMESPACE};
