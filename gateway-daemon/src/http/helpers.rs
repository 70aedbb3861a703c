use std::str::FromStr;

use hyper::{body, Body, Request, Response};
use routerify::prelude::*;
use serde::de::DeserializeOwned;

use super::error::Error;

pub fn parse_param<T>(req: &Request<Body>, name: &str) -> Result<T, Error>
where
    T: FromStr,
    T::Err: ToString,
{
    let data = req.param(name).ok_or_else(|| Error::parameter_missing(name))?;
    T::from_str(data).map_err(|e| Error::parameter_error(name, e))
}

pub async fn parse_body<T: DeserializeOwned>(req: &mut Request<Body>) -> Result<T, Error> {
    let data = body::to_bytes(req.body_mut())
        .await
        .map_err(|e| Error::ParseError(e.to_string()))?;
    serde_json::from_slice(data.as_ref()).map_err(|e| Error::ParseError(e.to_string()))
}

pub fn serialize_response<T: serde::Serialize>(resp: &T) -> Result<Response<Body>, Error> {
    let data = serde_json::to_vec(resp).map_err(|e| Error::ParseError(e.to_string()))?;
    Ok(Response::builder()
        .header("Content-Type", "application/json")
        .body(Body::from(data))
        .expect("building a response from a fixed set of headers cannot fail"))
}
