pub mod replays;
