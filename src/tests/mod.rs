
mod room_scenarios;
