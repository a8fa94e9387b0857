//! Venue correction engine: statistics, baseline selection, the two
//! correction strategies, validation and time conversion.

pub mod baseline;
pub mod convert;
pub mod correction;
pub mod gender;
pub mod mixed;
pub mod percentile;
pub mod results;
pub mod stats;
pub mod validation;

pub use baseline::{BaselineSelection, ReferenceVenue};
pub use convert::{ConvertError, TimeConverter};
pub use correction::{run_model, CorrectionTable, RunDiagnostics, Strategy};
pub use results::{Gender, ResultRecord, ResultSet};
pub use stats::VenueStatistics;
