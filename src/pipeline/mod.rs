pub mod backfill;
pub mod live;
pub mod lookup;

pub use backfill::Backfill;
pub use live::LiveJob;
pub use lookup::find_ids;
