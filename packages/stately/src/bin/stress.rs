use serde_json::{json, Value};

use stately::{HandlerTable, Mode, Store, System};

fn main() -> anyhow::Result<()> {
    let counter = HandlerTable::new()
        .on("tick", |entity, _, _| {
            let ticks = entity.get("ticks").and_then(Value::as_u64).unwrap_or(0);
            entity.set("ticks", ticks + 1);
            Ok(())
        })
        .on("destroy", |entity, _, facade| {
            let ticks = entity.get("ticks").cloned().unwrap_or(Value::Null);
            facade.notify("retired", json!({ "id": entity.id(), "ticks": ticks }))?;
            Ok(())
        });

    let census = System::new("census").on("retired", |draft, _, _| {
        draft.update("census", |census| {
            let retired = census.get("retired").and_then(Value::as_u64).unwrap_or(0);
            census.set("retired", retired + 1);
        });
        Ok(())
    });

    let store = Store::builder()
        .type_def("counter", counter)
        .type_def("census", HandlerTable::new())
        .system(census)
        .mode(Mode::Manual)
        .auto_populate(true)
        .build()?;
    store.update()?;

    let mut next_id = 0;
    let mut to_remove = Vec::new();

    for _ in 0..8 {
        for id in to_remove.drain(..) {
            store.notify("remove", Value::String(id))?;
        }

        for idx in 0..512 {
            let id = format!("c{}", next_id);
            next_id += 1;
            store.notify("add", json!({ "id": id, "type": "counter" }))?;

            if idx % 12 == 11 {
                to_remove.push(id);
            }
        }

        store.notify("tick", Value::Null)?;
        store.update()?;
    }

    let state = store.state();
    let live = state.of_type("counter").count();
    let ticks: u64 = state.of_type("counter")
        .filter_map(|e| e.get("ticks").and_then(Value::as_u64))
        .sum();
    let retired = state.get("census")
        .and_then(|e| e.get("retired").cloned())
        .unwrap_or(Value::Null);

    println!("live: {}, ticks: {}, retired: {}", live, ticks, retired);
    Ok(())
}
