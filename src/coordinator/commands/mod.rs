pub mod start_charge;
pub mod stop_charge;
