pub mod unit;

pub use unit::PersistenceUnit;
pub(crate) use unit::UnitInner;
