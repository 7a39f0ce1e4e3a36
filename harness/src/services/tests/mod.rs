mod environment;
mod tracker;
