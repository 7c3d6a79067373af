use serde_json::{json, Value};

use stately::{HandlerTable, Store};

fn main() -> anyhow::Result<()> {
    let kitty = HandlerTable::new()
        .on("create", |entity, _, _| {
            entity.set("lives", 9);
            Ok(())
        })
        .on("feed", |entity, _, _| {
            entity.set("isFed", true);
            Ok(())
        });

    let store = Store::builder()
        .type_def("kitty", kitty)
        .entities_json(json!({ "k1": { "type": "kitty" } }))
        .build()?;

    let _subscription = store.subscribe(|state| {
        println!("pass: {}", serde_json::to_string(&**state).unwrap_or_default());
    });

    store.notify("feed", Value::Null)?;
    store.notify("add", json!({ "id": "k2", "type": "kitty" }))?;
    store.notify("#k2:feed", Value::Null)?;
    store.notify("remove", "k1")?;

    println!("state: {}", serde_json::to_string_pretty(&*store.state())?);
    println!("kitties: {:?}", store.entities_of("kitty"));
    Ok(())
}
