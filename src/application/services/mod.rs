pub mod position_service;
pub mod trading_engine;
