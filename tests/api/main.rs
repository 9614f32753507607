mod config;
mod flows;
mod health_check;
mod helpers;
mod transactions;
mod users;
