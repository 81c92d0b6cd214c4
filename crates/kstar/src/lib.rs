//! KSTAR memory: episodic traces, declarative perceptions and facts,
//! procedural skills, and control-token authority, with xAPI emission and
//! portable export/import bundles.

pub mod bundle;
pub mod records;
pub mod store;
pub mod xapi;

pub use bundle::{Bundle, ExportOptions, ImportOptions, ImportResult};
pub use records::{
    ControlToken, Fact, Perception, SkillRecord, TokenInvalidReason, TokenVerification, Trace,
};
pub use store::{Family, KstarStore, TraceFilter};
pub use xapi::{XapiStatement, XapiVerb, XapiWriter};
