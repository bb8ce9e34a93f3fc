use rocket::Route;

mod common;
mod counter;
mod paper;
mod vote;

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(vote::routes());
    routes.extend(counter::routes());
    routes.extend(paper::routes());
    routes
}
